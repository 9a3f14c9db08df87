//! 송신 흐름 제어
//!
//! - 송신 큐: 새 패킷과 재전송 깨우기 신호를 하나의 채널로 직렬화
//! - 재전송 큐: 수신 경로/타이머 경로에서 추가, 송신 루프에서 소비
//! - 전송률: NACK 깊이 기반 감소, 주기마다 소폭 증가

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::{Config, Throughput};
use crate::packet::Packet;
use crate::{Error, Result, MTU};

/// pacing 간격 상한 (밀리초)
const MAX_SND_INTERVAL_MS: u64 = 30_000;

/// 전송률 조정 계수 (8 = 변화 없음)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RateAdjust {
    BigDecrease = 2,
    MediumDecrease = 4,
    SmallDecrease = 6,
    None = 8,
    SmallIncrease = 9,
    MediumIncrease = 12,
    BigIncrease = 16,
}

impl RateAdjust {
    pub fn factor(self) -> u64 {
        self as u64
    }

    /// NACK이 보고한 손실 깊이(송신 위치 - low)로 감소 폭 결정
    pub fn for_nack_depth(depth: i64, cache_size: usize) -> Self {
        let cache = cache_size as i64;
        if depth > cache >> 1 {
            RateAdjust::BigDecrease
        } else if depth > cache / 3 {
            RateAdjust::MediumDecrease
        } else if depth > cache >> 2 {
            RateAdjust::SmallDecrease
        } else {
            RateAdjust::None
        }
    }
}

/// 송신 루프 명령
#[derive(Debug)]
pub enum FlowCmd {
    /// 애플리케이션 패킷 송신
    Send(Packet),
    /// 재전송 큐 확인
    Wake,
}

#[derive(Debug)]
struct RateState {
    /// 목표 전송률 (bytes/sec)
    cur_rate: u32,
    /// 측정 전송률 (bytes/sec)
    actual_rate: u32,
    adjust: RateAdjust,
    snd_interval_ms: u64,
    last_packets: u64,
    last_bytes: u64,
    last_time: Instant,
}

/// 전송률 상태 스냅샷
#[derive(Debug, Clone, Copy)]
pub struct RateSnapshot {
    pub cur_rate: u32,
    pub actual_rate: u32,
    pub snd_interval_ms: u64,
    pub adjust: RateAdjust,
}

/// 송신 흐름 제어기
pub struct RateController {
    min_rate: u32,
    max_rate: u32,
    check_interval: u64,
    throughput: Throughput,
    state: Mutex<RateState>,
    resend: Mutex<VecDeque<Packet>>,
    tx: mpsc::Sender<FlowCmd>,
}

impl RateController {
    /// 제어기와 송신 루프가 읽을 명령 수신단 생성
    pub fn new(config: &Config, now: Instant) -> (Self, mpsc::Receiver<FlowCmd>) {
        let (tx, rx) = mpsc::channel(config.send_queue_size.max(1));

        let min_rate = config.min_rate();
        let max_rate = config.max_rate();
        let cur_rate = ((min_rate + max_rate) / 2).max(min_rate);

        let controller = Self {
            min_rate,
            max_rate,
            check_interval: config.check_interval(),
            throughput: config.throughput,
            state: Mutex::new(RateState {
                cur_rate,
                actual_rate: 0,
                adjust: RateAdjust::SmallIncrease,
                snd_interval_ms: (MTU as u64 * 1000) / cur_rate as u64,
                last_packets: 0,
                last_bytes: 0,
                last_time: now,
            }),
            resend: Mutex::new(VecDeque::new()),
            tx,
        };

        debug!(
            "전송률 min/cur/max: {}/{}/{} B/s, check interval: {}",
            min_rate, cur_rate, max_rate, controller.check_interval
        );

        (controller, rx)
    }

    /// 새 패킷을 송신 큐에 추가 (큐가 차면 대기)
    pub async fn enqueue(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(FlowCmd::Send(packet))
            .await
            .map_err(|_| Error::ChannelError)
    }

    /// 재전송 예약
    ///
    /// 이미 대기 중이면 scope만 올리고 false.
    pub fn enqueue_resend(&self, mut packet: Packet, scope: u8) -> bool {
        {
            let mut queue = self.resend.lock();
            if let Some(p) = queue
                .iter_mut()
                .find(|p| p.source == packet.source && p.seqno == packet.seqno)
            {
                if p.scope < scope {
                    p.scope = scope;
                }
                return false;
            }

            trace!("재전송 예약 #{} @{}", packet.seqno, scope);
            packet.scope = scope;
            queue.push_back(packet);
        }

        self.wake();
        true
    }

    /// 송신 루프 깨우기
    pub fn wake(&self) {
        // 큐가 가득 찼으면 송신 루프가 이미 깨어 있다
        let _ = self.tx.try_send(FlowCmd::Wake);
    }

    pub fn dequeue_resend(&self) -> Option<Packet> {
        self.resend.lock().pop_front()
    }

    pub fn has_resend(&self) -> bool {
        !self.resend.lock().is_empty()
    }

    pub fn resend_len(&self) -> usize {
        self.resend.lock().len()
    }

    /// 다른 참여자가 같은 복구를 보냈을 때 대기 중인 재전송 취소
    pub fn cancel_resend(&self, source: u32, seqno: u32, scope: u8) -> bool {
        let mut queue = self.resend.lock();
        match queue
            .iter()
            .position(|p| p.source == source && p.seqno == seqno && p.scope <= scope)
        {
            Some(i) => {
                trace!("재전송 취소 #{}", seqno);
                queue.remove(i);
                true
            }
            None => false,
        }
    }

    /// 재전송 ID(복구 요청자)로 대기 중인 재전송 취소, 취소한 개수 반환
    pub fn cancel_resend_by_id(&self, source: u32, id: u32, scope: u8) -> usize {
        let mut queue = self.resend.lock();
        let before = queue.len();
        queue.retain(|p| !(p.source == source && p.retransmit_id == id && p.scope <= scope));
        let cancelled = before - queue.len();
        if cancelled > 0 {
            trace!("재전송 취소 id={:08x} ({}개)", id, cancelled);
        }
        cancelled
    }

    /// NACK 수신 시 감소 폭 설정
    pub fn on_nack(&self, depth: i64, cache_size: usize) {
        self.state.lock().adjust = RateAdjust::for_nack_depth(depth, cache_size);
    }

    /// 송신 카운터를 보고 전송률 재계산
    ///
    /// check interval만큼 보냈을 때만 측정하고, 측정한 실제 전송률을 반환한다.
    pub fn flow_control(&self, packets: u64, bytes: u64, now: Instant) -> Option<u32> {
        let mut s = self.state.lock();

        let pcount = packets.saturating_sub(s.last_packets);
        if pcount < self.check_interval {
            return None;
        }

        let bcount = bytes.saturating_sub(s.last_bytes);
        s.last_packets = packets;
        s.last_bytes = bytes;

        let elapsed = now.saturating_duration_since(s.last_time).as_millis().max(1) as u64;
        s.actual_rate = (bcount * 1000 / elapsed).min(u32::MAX as u64) as u32;
        s.last_time = now;

        if self.throughput == Throughput::Constant {
            return Some(s.actual_rate);
        }

        let cur = (s.cur_rate as u64 * s.adjust.factor()) >> 3;
        s.cur_rate = (cur as u32).clamp(self.min_rate, self.max_rate);
        s.adjust = RateAdjust::SmallIncrease;

        if bytes > 0 {
            s.snd_interval_ms = (bcount * 1000 / pcount) / s.cur_rate as u64;
        }

        if (s.actual_rate as u64) < (s.cur_rate as u64 * 3) / 4 {
            s.snd_interval_ms = s.snd_interval_ms * 3 / 4;
        }
        s.snd_interval_ms = s.snd_interval_ms.min(MAX_SND_INTERVAL_MS);

        debug!(
            "rate/interval: {}/{}ms (actual {})",
            s.cur_rate, s.snd_interval_ms, s.actual_rate
        );
        Some(s.actual_rate)
    }

    /// 다음 송신까지 대기 시간 (best-effort면 None)
    pub fn pacing_delay(&self) -> Option<Duration> {
        if self.throughput == Throughput::BestEffort {
            return None;
        }
        let ms = self.state.lock().snd_interval_ms;
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let s = self.state.lock();
        RateSnapshot {
            cur_rate: s.cur_rate,
            actual_rate: s.actual_rate,
            snd_interval_ms: s.snd_interval_ms,
            adjust: s.adjust,
        }
    }
}
