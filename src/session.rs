//! 세션 핸들
//!
//! 세 개의 실행 흐름을 묶는다.
//! - 수신 루프: 데이터그램을 [`Dispatcher::parse`]로 전달
//! - 송신 루프: 송신 큐/재전송 큐를 비우며 pacing
//! - 타이머 루프: 복구/보고 타이머 실행
//!
//! 수신 루프와 타이머는 같은 프로토콜 상태를 바꾸므로 [`Dispatcher`] 전체를 하나의 락으로 보호한다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::SystemClock;
use crate::codec::BROADCAST;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, EventReceiver, Services};
use crate::flow::{FlowCmd, RateController, RateSnapshot};
use crate::packet::Packet;
use crate::stats::{DomainStats, SessionStats};
use crate::timer::{Scheduler, TimerHandle, TimerKind, TimerService};
use crate::transport::{Transport, UdpTransport};
use crate::{Error, Result};

/// 수신 대기 타임아웃 (정지 플래그 확인 주기)
const RECV_POLL: Duration = Duration::from_millis(100);

struct Shared {
    core: Mutex<Dispatcher>,
    rate: Arc<RateController>,
    timer: TimerService,
    scheduler: Arc<SessionScheduler>,
    running: AtomicBool,
    local_id: u32,
}

impl Shared {
    fn handle_datagram(&self, datagram: Bytes, from: SocketAddr) {
        if self.running.load(Ordering::SeqCst) {
            self.core.lock().parse(datagram, from.ip());
        }
    }

    /// 패킷 하나 송신 후 전송률 재계산, 다음 송신까지 대기
    async fn transmit_paced(&self, packet: Packet, resend: bool) {
        let (packets, bytes) = self.core.lock().transmit(packet, resend);
        self.rate.flow_control(packets, bytes, Instant::now());

        if let Some(delay) = self.rate.pacing_delay() {
            tokio::time::sleep(delay).await;
        }
    }

    /// 대기 중인 재전송을 새 패킷과 같은 속도로 송신
    async fn flush_resends(&self) {
        while self.running.load(Ordering::SeqCst) {
            let Some(packet) = self.rate.dequeue_resend() else {
                break;
            };
            self.transmit_paced(packet, true).await;
        }
    }
}

/// 타이머 종류별로 가장 이른 마감 하나만 유지하는 스케줄러
struct SessionScheduler {
    timer: TimerService,
    shared: Weak<Shared>,
    pending: Mutex<HashMap<TimerKind, (Instant, TimerHandle)>>,
}

impl SessionScheduler {
    /// 실행 직전 예약 정보 제거 (같은 마감일 때만)
    fn clear(&self, kind: TimerKind, at: Instant) {
        let mut pending = self.pending.lock();
        if pending.get(&kind).map_or(false, |(t, _)| *t == at) {
            pending.remove(&kind);
        }
    }
}

impl Scheduler for SessionScheduler {
    fn schedule(&self, kind: TimerKind, at: Instant) {
        let mut pending = self.pending.lock();
        if let Some((existing, handle)) = pending.get(&kind) {
            if *existing <= at {
                return;
            }
            self.timer.cancel(handle);
        }

        let shared = self.shared.clone();
        let delay = at.saturating_duration_since(Instant::now());
        let handle = self.timer.register(delay, move || fire(&shared, kind, at));
        pending.insert(kind, (at, handle));
    }
}

fn fire(shared: &Weak<Shared>, kind: TimerKind, at: Instant) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    // 핸들러 안에서 다시 예약할 수 있도록 먼저 비운다
    shared.scheduler.clear(kind, at);
    if shared.running.load(Ordering::SeqCst) {
        shared.core.lock().on_timer(kind);
    }
}

/// 멀티캐스트 세션
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// 세션 참여 (tokio 런타임 안에서 호출)
    ///
    /// 애플리케이션 이벤트 수신단을 함께 반환한다.
    pub async fn join(config: Config, transport: Arc<dyn Transport>) -> Result<(Self, EventReceiver)> {
        config.validate()?;

        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let local_id = loop {
            let id: u32 = rng.gen();
            if id != 0 && id != BROADCAST {
                break id;
            }
        };

        let clock = Arc::new(SystemClock);
        let (rate, flow_rx) = RateController::new(&config, Instant::now());
        let rate = Arc::new(rate);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let timer = TimerService::start();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let scheduler = Arc::new(SessionScheduler {
                timer: timer.clone(),
                shared: weak.clone(),
                pending: Mutex::new(HashMap::new()),
            });
            let dispatcher = Dispatcher::new(
                config.clone(),
                local_id,
                rng,
                Services {
                    rate: rate.clone(),
                    transport,
                    scheduler: scheduler.clone(),
                    clock,
                    events: events_tx,
                },
            );
            Shared {
                core: Mutex::new(dispatcher),
                rate: rate.clone(),
                timer: timer.clone(),
                scheduler,
                running: AtomicBool::new(true),
                local_id,
            }
        });

        shared.core.lock().start();

        let runner = shared.clone();
        tokio::spawn(async move {
            send_loop(runner, flow_rx).await;
        });

        info!(
            "세션 참여: id={:08x} ttl={} {:?}/{:?}",
            local_id, config.ttl, config.reliability, config.throughput
        );

        Ok((Self { shared }, events_rx))
    }

    /// 신뢰성 패킷 송신 (송신 큐가 차면 대기)
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.enqueue(Packet::reliable(payload)).await
    }

    /// 비신뢰성 패킷 송신
    pub async fn send_unreliable(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.enqueue(Packet::unreliable(payload)).await
    }

    async fn enqueue(&self, packet: Packet) -> Result<()> {
        if !self.is_running() {
            return Err(Error::SessionStopped);
        }
        let max = Packet::max_payload(packet.reliable);
        if packet.len() > max {
            return Err(Error::PacketTooLarge {
                len: packet.len(),
                max,
            });
        }
        self.shared.rate.enqueue(packet).await
    }

    /// 외부 수신 루프에서 받은 데이터그램 전달
    pub fn handle_datagram(&self, datagram: Bytes, from: SocketAddr) {
        self.shared.handle_datagram(datagram, from);
    }

    /// UDP 수신 루프 시작
    pub fn spawn_receiver(&self, transport: Arc<UdpTransport>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];

            while shared.running.load(Ordering::SeqCst) {
                match tokio::time::timeout(RECV_POLL, transport.recv_from(&mut buf)).await {
                    Ok(Ok((len, addr))) => {
                        shared.handle_datagram(Bytes::copy_from_slice(&buf[..len]), addr);
                    }
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                    }
                    Err(_) => {
                        // 타임아웃, 계속
                    }
                }
            }

            debug!("수신 루프 종료");
        })
    }

    /// 세션 TTL 변경 (진행 중인 복구는 버림)
    pub fn set_ttl(&self, ttl: u8) {
        self.shared.core.lock().set_ttl(ttl);
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.core.lock().stats().clone()
    }

    pub fn domain_stats(&self) -> Vec<DomainStats> {
        self.shared.core.lock().domain_stats()
    }

    pub fn rate(&self) -> RateSnapshot {
        self.shared.rate.snapshot()
    }

    /// 로컬 참여자 ID
    pub fn whoami(&self) -> u32 {
        self.shared.local_id
    }

    /// 정지: 타이머와 송신 루프 종료
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.timer.shutdown();
            self.shared.rate.wake();
            info!("세션 종료: id={:08x}", self.shared.local_id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 송신 루프: 재전송 우선, 송신마다 전송률 재계산 후 pacing
async fn send_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<FlowCmd>) {
    while let Some(cmd) = rx.recv().await {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        shared.flush_resends().await;

        if let FlowCmd::Send(packet) = cmd {
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            shared.transmit_paced(packet, false).await;
        }
    }

    debug!("송신 루프 종료");
}
