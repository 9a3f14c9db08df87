//! 수신 데이터그램 처리와 시퀀스 추적
//!
//! - 데이터그램 검증, 참여자 확인, 다중화 레코드 분배
//! - 소스별 시퀀스 상태 머신 (중복 / 순서대로 / 복구 가능 / 복구 불가)
//! - 로컬 송신 (시퀀스 부여, 캐시, 인코딩)
//!
//! 제어 레코드 처리와 주기 보고는 [`control`](crate::control)에 있다.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::codec::{self, Frame, Frames, Record, RecordHeader, MIN_RECORD_LEN};
use crate::config::Config;
use crate::control::ReportState;
use crate::entity::{PeerRecord, SourceDirectory, SourceRecord};
use crate::flow::RateController;
use crate::loss::ErrorCause;
use crate::packet::{seq_diff, Packet};
use crate::recovery::{LossOutcome, RecoveryEngine};
use crate::stats::{DomainStats, SessionStats};
use crate::timer::{Scheduler, TimerKind};
use crate::transport::Transport;
use crate::Error;

/// 애플리케이션으로 전달되는 이벤트
#[derive(Debug)]
pub enum SessionEvent {
    /// 수신 패킷 (신뢰성 패킷은 소스별 순서대로)
    Data(Packet),
    /// 복구 불가 손실. 연속 손실 구간마다 한 번.
    SequenceError {
        source: u32,
        cause: ErrorCause,
        /// 구간의 첫 시퀀스
        seqno: u32,
    },
    /// 소스가 세션을 떠남
    EndOfSequence(u32),
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// 디스패처가 호출하는 외부 구성요소
pub struct Services {
    pub rate: Arc<RateController>,
    pub transport: Arc<dyn Transport>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub events: EventSender,
}

/// 프로토콜 코어
///
/// 수신 경로와 타이머 경로가 같은 상태를 바꾸므로 세션은 이 구조체 전체를 하나의 락 뒤에 둔다.
pub struct Dispatcher {
    pub(crate) config: Config,
    pub(crate) ttl: u8,
    pub(crate) directory: SourceDirectory,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) stats: SessionStats,
    pub(crate) reports: ReportState,
    pub(crate) rate: Arc<RateController>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventSender,
    pub(crate) rng: StdRng,
}

impl Dispatcher {
    pub fn new(config: Config, local_id: u32, mut rng: StdRng, services: Services) -> Self {
        let Services {
            rate,
            transport,
            scheduler,
            clock,
            events,
        } = services;

        let now = clock.now();
        let mut me = PeerRecord::new(local_id, transport.local_ip());
        me.touch(now);
        let local = SourceRecord::new(me, rng.gen(), config.send_window_size);

        let ttl = config.ttl;
        let recovery = RecoveryEngine::new(ttl, local_id, config.max_nack_tries(), now);
        let reports = ReportState::new(&config, now);

        Self {
            directory: SourceDirectory::new(local, config.rcv_window_size),
            recovery,
            stats: SessionStats::new(),
            reports,
            ttl,
            config,
            rate,
            transport,
            scheduler,
            clock,
            events,
            rng,
        }
    }

    /// 주기 보고 타이머 시작
    pub fn start(&mut self) {
        let now = self.clock.now();
        self.schedule_report(now);
    }

    pub fn local_id(&self) -> u32 {
        self.directory.local_id()
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn domain_stats(&self) -> Vec<DomainStats> {
        DomainStats::from_chain(self.recovery.domains())
    }

    pub fn directory(&self) -> &SourceDirectory {
        &self.directory
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// 세션 TTL 변경: 도메인 체인 재구성 (진행 중인 손실 이벤트는 버림)
    pub fn set_ttl(&mut self, ttl: u8) {
        let now = self.clock.now();
        self.ttl = ttl;
        self.config.ttl = ttl;
        self.recovery =
            RecoveryEngine::new(ttl, self.local_id(), self.config.max_nack_tries(), now);
        info!("세션 TTL 변경: {}", ttl);
    }

    /// 타이머 만료 처리
    pub fn on_timer(&mut self, kind: TimerKind) {
        let now = self.clock.now();
        match kind {
            TimerKind::Recovery => self.on_recovery_timer(now),
            TimerKind::Report => self.on_report_timer(now),
        }
    }

    /// 수신 데이터그램 처리
    ///
    /// 잘못된 입력은 통계에 남기고 버린다. 세션 상태에는 영향이 없다.
    pub fn parse(&mut self, datagram: Bytes, addr: IpAddr) {
        let now = self.clock.now();
        let len = datagram.len();

        if len < MIN_RECORD_LEN {
            self.stats.bad_length += 1;
            warn!("짧은 데이터그램 무시: {} bytes from {}", len, addr);
            return;
        }

        let header = match RecordHeader::decode(&datagram) {
            Ok(header) => header,
            Err(e) => {
                self.count_error(&e);
                warn!("잘못된 데이터그램 ({}): {}", addr, e);
                return;
            }
        };

        if header.entity == self.local_id() {
            self.stats.loopback += 1;
            return;
        }

        let Some(id) = self.directory.lookup(header.entity, addr, now) else {
            self.stats.rejected += 1;
            debug!("거부된 데이터그램: {:08x} @{}", header.entity, addr);
            return;
        };
        if let Some(peer) = self.directory.peer_mut(id) {
            peer.touch(now);
        }

        if header.is_control() {
            self.stats.control_packets += 1;
            self.stats.control_bytes += len as u64;
        } else {
            self.stats.data_packets += 1;
            self.stats.data_bytes += len as u64;
        }

        // 검증은 첫 레코드 기준이므로 뒤 레코드도 같은 참여자여야 한다
        for frame in Frames::new(datagram) {
            match frame {
                Ok(frame) if frame.header.entity != id => {
                    self.stats.rejected += 1;
                    debug!(
                        "다른 참여자 레코드 무시: {:08x} in {:08x} @{}",
                        frame.header.entity, id, addr
                    );
                }
                Ok(frame) => self.dispatch(frame, addr, now),
                Err(e) => {
                    self.count_error(&e);
                    debug!("레코드 무시 ({}): {}", addr, e);
                }
            }
        }

        self.rearm_recovery();
    }

    fn count_error(&mut self, e: &Error) {
        match e {
            Error::InvalidVersion { .. } => self.stats.bad_version += 1,
            Error::InvalidRecordType(_) => self.stats.bad_type += 1,
            _ => self.stats.bad_length += 1,
        }
    }

    fn dispatch(&mut self, frame: Frame, addr: IpAddr, now: Instant) {
        let Frame { header, record } = frame;

        if let Some(peer) = self.directory.peer_mut(header.entity) {
            peer.distance = peer.distance.min(header.scope);
        }

        match record {
            Record::Data {
                timestamp,
                seqno,
                payload,
            } => self.process_data(header, addr, timestamp, seqno, payload, now),
            Record::Repair {
                source,
                seqno,
                payload,
            } => self.process_repair(header, source, seqno, payload, now),
            Record::Unreliable { payload } => self.process_unreliable(header, payload, now),
            // 예약된 확장 지점
            Record::Fec { .. } => self.stats.fec_records += 1,
            Record::Nack(nack) => self.process_nack(header, nack, now),
            Record::NackReply(entries) => self.process_nack_reply(header, entries),
            Record::SenderReport(sr) => self.process_sender_report(header, addr, sr, now),
            Record::RrSelection(rs) => self.process_rr_selection(header, rs, now),
            Record::ReceiverReport(entries) => self.process_receiver_report(header, entries),
        }
    }

    fn process_data(
        &mut self,
        header: RecordHeader,
        addr: IpAddr,
        timestamp: u32,
        seqno: u32,
        payload: Bytes,
        now: Instant,
    ) {
        let src = header.entity;
        let Some(source) = self.directory.lookup_sender(src, addr, seqno, now) else {
            self.stats.rejected += 1;
            return;
        };
        source.last_time_for_data = Some(now);

        let mut packet = Packet::reliable(payload);
        packet.seqno = seqno;
        packet.scope = header.scope;
        packet.source = src;
        packet.sender = src;
        packet.timestamp = timestamp;
        packet.received_at = Some(now);
        self.sequence(packet, now);
    }

    fn process_repair(
        &mut self,
        header: RecordHeader,
        source_id: u32,
        seqno: u32,
        payload: Bytes,
        now: Instant,
    ) {
        let sender = header.entity;

        // 다른 참여자가 이미 보냈으므로 대기 중인 같은 재전송은 불필요
        self.rate.cancel_resend(source_id, seqno, header.scope);
        self.recovery.heard_repair(source_id, seqno);

        if source_id == self.local_id() {
            return;
        }
        let Some(source) = self.directory.source_mut(source_id) else {
            debug!("알 수 없는 소스의 복구 패킷: {:08x} #{}", source_id, seqno);
            return;
        };
        source.repairs += 1;
        if sender != source_id {
            source.third_party_repairs += 1;
        }

        let mut packet = Packet::reliable(payload);
        packet.seqno = seqno;
        packet.scope = header.scope;
        packet.source = source_id;
        packet.sender = sender;
        packet.received_at = Some(now);
        self.sequence(packet, now);

        if let Some(source) = self.directory.source(source_id) {
            self.recovery.after_repair(source, seqno);
        }
    }

    fn process_unreliable(&mut self, header: RecordHeader, payload: Bytes, now: Instant) {
        self.stats.out_of_band += 1;

        let mut packet = Packet::unreliable(payload);
        packet.scope = header.scope;
        packet.source = header.entity;
        packet.sender = header.entity;
        packet.received_at = Some(now);
        emit(&self.events, SessionEvent::Data(packet));
    }

    /// 시퀀스 상태 머신
    fn sequence(&mut self, packet: Packet, now: Instant) {
        let src = packet.source;
        let seqno = packet.seqno;
        let Some(source) = self.directory.source_mut(src) else {
            return;
        };
        source.packets += 1;
        source.bytes += packet.len() as u64;

        let diff = seq_diff(seqno, source.expected);
        if diff < 0 || (diff > 0 && source.is_cached(seqno)) {
            source.duplicates += 1;
            trace!("중복 {:08x} #{}", src, seqno);
            return;
        }

        if diff as usize > source.cache_size() {
            self.overrun(packet, now);
            return;
        }

        source.observe_seqno(seqno);
        source.put_packet(packet);
        self.drain(src);
        self.check_gap(src, now);
    }

    /// `expected`부터 캐시에 연속으로 있는 패킷 전달
    fn drain(&mut self, src: u32) {
        let keep = self.config.send_repair;
        let Some(source) = self.directory.source_mut(src) else {
            return;
        };

        while let Some(packet) = source.get_packet(source.expected).cloned() {
            if !keep {
                source.cache.remove_by_seqno(packet.seqno);
            }
            source.lastseq = source.expected;
            source.expected = source.expected.wrapping_add(1);
            emit(&self.events, SessionEvent::Data(packet));
        }
    }

    /// 남은 간격이 있으면 손실 복구 시작
    pub(crate) fn check_gap(&mut self, src: u32, now: Instant) {
        let Some(source) = self.directory.source(src) else {
            return;
        };
        if src == self.local_id() || seq_diff(source.maxseq, source.expected) < 0 {
            return;
        }

        if self.config.loss_allowed() {
            // 복구 없이 캐시에 있는 데까지 건너뜀
            let target = source.maxseq.wrapping_add(1);
            self.skip_to(src, target, None);
            return;
        }

        let expected = source.expected;
        if self.recovery.handle_loss(source, now, &mut self.rng) == LossOutcome::Overrun {
            self.resync(src, ErrorCause::BufferOverrun, expected, now);
        }
    }

    /// 캐시 범위를 넘는 시퀀스 수신
    fn overrun(&mut self, packet: Packet, now: Instant) {
        let src = packet.source;
        let seqno = packet.seqno;
        let Some(source) = self.directory.source(src) else {
            return;
        };
        let window = source.cache_size() as u32;
        let target = seqno.wrapping_sub(window).wrapping_add(1);
        warn!(
            "버퍼 초과 {:08x}: expected={} got={} (cache {})",
            src, source.expected, seqno, window
        );

        self.recovery.cancel_loss(src);
        let cause = (!self.config.loss_allowed()).then_some(ErrorCause::BufferOverrun);
        self.skip_to(src, target, cause);

        if let Some(source) = self.directory.source_mut(src) {
            source.observe_seqno(seqno);
            source.put_packet(packet);
        }
        self.drain(src);
        self.check_gap(src, now);
    }

    /// 복구 불가 손실 처리 후 재동기화
    pub(crate) fn resync(&mut self, src: u32, cause: ErrorCause, seqno: u32, now: Instant) {
        self.recovery.cancel_loss(src);

        let Some(source) = self.directory.source(src) else {
            self.stats.failures += 1;
            error!("소스 소실 {:08x}: {:?} at #{}", src, cause, seqno);
            emit(
                &self.events,
                SessionEvent::SequenceError {
                    source: src,
                    cause,
                    seqno,
                },
            );
            return;
        };

        let target = match cause {
            // 복구 못 한 구멍만 건너뜀
            ErrorCause::MaxTriesReached => next_cached(source),
            ErrorCause::BufferOverrun => source
                .maxseq
                .wrapping_sub(source.cache_size() as u32)
                .wrapping_add(1),
            ErrorCause::SenderLost | ErrorCause::SenderGone => source.maxseq.wrapping_add(1),
        };

        self.skip_to(src, target, Some(cause));
        self.drain(src);
        self.check_gap(src, now);
    }

    /// `expected`를 `target`까지 강제로 전진
    ///
    /// 캐시에 남은 패킷은 순서대로 전달하고, 연속 손실 구간마다 한 번만 통지한다.
    /// `cause`가 None이면 통지하지 않는다.
    fn skip_to(&mut self, src: u32, target: u32, cause: Option<ErrorCause>) {
        let keep = self.config.send_repair;
        let Some(source) = self.directory.source_mut(src) else {
            return;
        };

        let mut in_gap = false;
        while seq_diff(target, source.expected) > 0 {
            let seq = source.expected;

            if seq_diff(seq, source.maxseq) > 0 {
                // maxseq 이후는 전부 손실
                if !in_gap {
                    report_gap(&self.events, &mut self.stats, source, cause, seq);
                }
                source.expected = target;
                break;
            }

            match source.get_packet(seq).cloned() {
                Some(packet) => {
                    in_gap = false;
                    if !keep {
                        source.cache.remove_by_seqno(seq);
                    }
                    source.lastseq = seq;
                    emit(&self.events, SessionEvent::Data(packet));
                }
                None if !in_gap => {
                    in_gap = true;
                    report_gap(&self.events, &mut self.stats, source, cause, seq);
                }
                None => {}
            }
            source.expected = seq.wrapping_add(1);
        }

        let last = source.expected.wrapping_sub(1);
        if seq_diff(last, source.maxseq) > 0 {
            source.maxseq = last;
        }
    }

    /// 애플리케이션 패킷 송신 (송신 루프에서 호출)
    ///
    /// 새 신뢰성 패킷은 다음 시퀀스를 받아 로컬 캐시에 저장된다.
    /// 누적 (송신 패킷 수, 바이트)를 반환한다.
    pub fn transmit(&mut self, packet: Packet, resend: bool) -> (u64, u64) {
        if resend {
            self.send_repair_packet(packet);
        } else if packet.reliable {
            self.send_data(packet);
        } else {
            self.count_sent(packet.len());
            let record = Record::Unreliable {
                payload: packet.payload,
            };
            let buf = codec::encode(self.ttl, self.local_id(), &record);
            self.send(&buf, self.ttl);
        }
        (self.stats.packets_sent, self.stats.bytes_sent)
    }

    fn send_data(&mut self, mut packet: Packet) {
        let now = self.clock.now();
        let timestamp = self.clock.ntp32();
        let local_id = self.local_id();
        let ttl = self.ttl;
        let len = packet.len();

        let local = self.directory.local_mut();
        let first = local.packets == 0;
        packet.seqno = local.expected;
        packet.source = local_id;
        packet.sender = local_id;
        packet.timestamp = timestamp;
        packet.scope = ttl;
        local.expected = local.expected.wrapping_add(1);
        local.maxseq = packet.seqno;
        local.lastseq = packet.seqno;
        local.packets += 1;
        local.bytes += len as u64;
        local.last_time_for_data = Some(now);

        let record = Record::Data {
            timestamp,
            seqno: packet.seqno,
            payload: packet.payload.clone(),
        };
        local.put_packet(packet);

        self.count_sent(len);
        let buf = codec::encode(ttl, local_id, &record);
        self.send(&buf, ttl);
        if first {
            self.send_sender_report(now);
        }
    }

    fn send_repair_packet(&mut self, packet: Packet) {
        let len = packet.len();
        let scope = packet.scope;
        self.stats.repairs_sent += 1;
        self.stats.repair_bytes_sent += len as u64;
        // 재전송도 전송률 측정에 포함
        self.count_sent(len);
        self.recovery.record_repair(scope, len);
        trace!("재전송 {:08x} #{} @{}", packet.source, packet.seqno, scope);

        let record = Record::Repair {
            source: packet.source,
            seqno: packet.seqno,
            payload: packet.payload,
        };
        let buf = codec::encode(scope, self.local_id(), &record);
        self.send(&buf, scope);
    }

    fn count_sent(&mut self, len: usize) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += len as u64;
    }

    /// 전송 실패는 기록만 한다
    pub(crate) fn send(&mut self, buf: &[u8], ttl: u8) {
        if let Err(e) = self.transport.send(buf, ttl) {
            self.stats.send_errors += 1;
            warn!("전송 실패 ({} bytes, ttl {}): {}", buf.len(), ttl, e);
        }
    }

    /// 가장 이른 손실 이벤트 마감으로 복구 타이머 예약
    pub(crate) fn rearm_recovery(&self) {
        if let Some(at) = self.recovery.next_timeout() {
            self.scheduler.schedule(TimerKind::Recovery, at);
        }
    }
}

/// `expected` 뒤 첫 캐시 패킷 (없으면 maxseq + 1)
fn next_cached(source: &SourceRecord) -> u32 {
    let mut seq = source.expected.wrapping_add(1);
    while seq_diff(seq, source.maxseq) <= 0 {
        if source.is_cached(seq) {
            return seq;
        }
        seq = seq.wrapping_add(1);
    }
    seq
}

fn report_gap(
    events: &EventSender,
    stats: &mut SessionStats,
    source: &mut SourceRecord,
    cause: Option<ErrorCause>,
    seqno: u32,
) {
    let Some(cause) = cause else {
        return;
    };
    if source.last_error == Some(seqno) {
        return;
    }
    source.last_error = Some(seqno);
    stats.failures += 1;
    error!("복구 불가 손실 {:08x} #{}: {:?}", source.id(), seqno, cause);
    emit(
        events,
        SessionEvent::SequenceError {
            source: source.id(),
            cause,
            seqno,
        },
    );
}

/// 애플리케이션 이벤트 전달 (수신단이 닫혔으면 버림)
pub(crate) fn emit(events: &EventSender, event: SessionEvent) {
    if let Err(mpsc::error::SendError(event)) = events.send(event) {
        debug!("이벤트 채널 닫힘, 버림: {:?}", event);
    }
}
