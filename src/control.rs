//! 제어 레코드 처리와 주기 보고
//!
//! NACK / NACK-Reply / SR / RR-Selection / RR 수신 처리, 복구 타이머 동작 실행,
//! 보고 타이머(SR, RR-Selection, RR 송신과 참여자 정리).

use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::clock::{duration_to_fixed32, fixed32_to_millis};
use crate::codec::{
    encode, encode_record, Nack, NackEntry, NackReplyEntry, Record, RecordHeader,
    ReceiverReportEntry, RrSelection, SenderReport, BROADCAST,
};
use crate::config::{Config, ReceiverReportPolicy};
use crate::dispatcher::{emit, Dispatcher, SessionEvent};
use crate::entity::{SourceRecord, RCV_DROP_TIME, SND_DROP_TIME};
use crate::loss::LossEvent;
use crate::packet::seq_diff;
use crate::recovery::{NackResponse, RecoveryAction};
use crate::timer::TimerKind;

/// SR 최소 간격
const MIN_SR_INTERVAL: Duration = Duration::from_secs(2);

/// RR 보고 주기 (초)
const RR_PERIOD_SECS: u16 = 10;

/// RR-Selection 목표 응답 수
const RR_TARGET_REPLIES: u64 = 100;

/// 다음 보고 시각
#[derive(Debug)]
pub(crate) struct ReportState {
    next_sr: Instant,
    next_rs: Instant,
    rs_interval: Duration,
}

impl ReportState {
    pub(crate) fn new(config: &Config, now: Instant) -> Self {
        let sr = Duration::from_millis(config.sender_report_interval_ms).max(MIN_SR_INTERVAL);
        let rs_interval = Duration::from_millis(config.rr_select_interval_ms.max(1));
        Self {
            next_sr: now + sr,
            next_rs: now + rs_interval,
            rs_interval,
        }
    }
}

impl Dispatcher {
    // ===== 수신 제어 레코드 =====

    pub(crate) fn process_nack(&mut self, header: RecordHeader, nack: Nack, now: Instant) {
        let reporter = header.entity;
        let local_id = self.local_id();
        self.stats.nacks_received += 1;
        if let Some(peer) = self.directory.peer_mut(reporter) {
            peer.nack_count += 1;
        }

        for entry in nack.entries {
            if entry.source == local_id {
                let local = self.directory.local();
                let depth = seq_diff(local.expected, entry.low) as i64;
                self.rate.on_nack(depth, local.cache_size());
            }

            let Some(source) = self.directory.source(entry.source) else {
                trace!("알 수 없는 소스의 NACK: {:08x}", entry.source);
                continue;
            };
            let ev = LossEvent::from_nack(
                entry.source,
                reporter,
                entry.low,
                entry.bitmask,
                header.scope,
                nack.timestamp,
                now,
            );

            let response = self.recovery.process_nack(
                ev,
                source,
                self.config.send_repair,
                now,
                &mut self.rng,
            );
            if let NackResponse::Resend { seqnos, scope } = response {
                debug!(
                    "NACK {:08x} -> 재전송 {}개 @{} (low {})",
                    reporter,
                    seqnos.len(),
                    scope,
                    entry.low
                );
                self.queue_repairs(entry.source, &seqnos, reporter, scope);
            }
        }
    }

    pub(crate) fn process_nack_reply(
        &mut self,
        header: RecordHeader,
        entries: Vec<NackReplyEntry>,
    ) {
        let local_id = self.local_id();

        for reply in entries {
            if reply.to == local_id {
                let rtt = self.rtt_sample(reply.timestamp, reply.delay);
                self.apply_rtt(header.entity, header.scope, rtt);
            }

            self.recovery.process_nack_reply(&reply);

            if reply.to != local_id {
                self.rate
                    .cancel_resend_by_id(reply.source, reply.to, header.scope);
            }
        }
    }

    pub(crate) fn process_sender_report(
        &mut self,
        header: RecordHeader,
        addr: IpAddr,
        sr: SenderReport,
        now: Instant,
    ) {
        self.stats.sender_reports += 1;
        let src = header.entity;

        let Some(source) = self.directory.lookup_sender(src, addr, sr.seqno, now) else {
            self.stats.rejected += 1;
            return;
        };

        estimate_rate(source, &sr);

        // SR은 다음 송신 시퀀스를 알려 주므로 꼬리 손실을 감지할 수 있다
        let last = sr.seqno.wrapping_sub(1);
        if seq_diff(last, source.maxseq) > 0 {
            debug!(
                "꼬리 손실 {:08x}: maxseq {} -> {}",
                src, source.maxseq, last
            );
            source.maxseq = last;
            self.check_gap(src, now);
        }
    }

    pub(crate) fn process_rr_selection(&mut self, header: RecordHeader, rs: RrSelection, now: Instant) {
        self.stats.rr_selections += 1;
        let src = header.entity;
        let local_id = self.local_id();
        if src == local_id {
            return;
        }

        let roll: u16 = self.rng.gen();
        let fraction: f64 = self.rng.gen_range(0.25..1.0);

        let targeted = rs
            .targets
            .iter()
            .any(|&t| t == local_id || t == BROADCAST);
        if !targeted && rs.probability != 0 && roll >= rs.probability {
            return;
        }
        let Some(source) = self.directory.source_mut(src) else {
            return;
        };

        let interval_ms = rs.period_secs as u32 * 1000;
        source.rr_timestamp = rs.timestamp;
        source.rr_prob = rs.probability as u32;
        source.rr_interval_ms = interval_ms;
        source.rr_select_time = Some(now);
        let delay = Duration::from_millis((interval_ms as f64 * fraction) as u64);
        source.next_rr_time = Some(now + delay);

        debug!("RR 선택됨 {:08x}: {:?} 후 보고", src, delay);
        self.schedule_report(now);
    }

    pub(crate) fn process_receiver_report(
        &mut self,
        header: RecordHeader,
        entries: Vec<ReceiverReportEntry>,
    ) {
        self.stats.receiver_reports += 1;
        let local_id = self.local_id();

        for entry in entries.into_iter().filter(|e| e.target == local_id) {
            let local = self.directory.local_mut();
            if entry.timestamp == local.rr_timestamp {
                local.rr_replies += 1;
            }
            trace!(
                "RR {:08x}: expected={} loss={}/256 lost={}",
                header.entity,
                entry.expected,
                entry.loss_rate,
                entry.abs_lost
            );

            let rtt = self.rtt_sample(entry.timestamp, entry.delay);
            self.apply_rtt(header.entity, header.scope, rtt);
        }
    }

    /// 에코된 타임스탬프로 RTT 계산 (밀리초, 음수 가능)
    fn rtt_sample(&self, timestamp: u32, delay: u32) -> i64 {
        let now = self.clock.ntp32();
        let fixed = now.wrapping_sub(timestamp).wrapping_sub(delay) as i32;
        fixed32_to_millis(fixed as i64)
    }

    fn apply_rtt(&mut self, peer: u32, scope: u8, rtt_ms: i64) {
        if rtt_ms < 0 {
            warn!("음수 RTT 샘플 무시: {}ms from {:08x}", rtt_ms, peer);
            return;
        }
        if let Some(peer) = self.directory.peer_mut(peer) {
            peer.rtt_ms = rtt_ms as u32;
        }
        self.recovery.update_rtt(scope, rtt_ms);
        trace!("RTT {:08x} @{}: {}ms", peer, scope, rtt_ms);
    }

    /// 캐시된 패킷을 재전송 큐에 추가
    fn queue_repairs(&mut self, source: u32, seqnos: &[u32], retransmit_id: u32, scope: u8) {
        let Some(record) = self.directory.source(source) else {
            return;
        };
        for &seqno in seqnos {
            if let Some(packet) = record.get_packet(seqno) {
                let mut packet = packet.clone();
                packet.retransmit_id = retransmit_id;
                self.rate.enqueue_resend(packet, scope);
            }
        }
    }

    // ===== 타이머 =====

    /// 복구 타이머: NACK 송신, 재동기화, 제3자 응답
    pub(crate) fn on_recovery_timer(&mut self, now: Instant) {
        let actions = self.recovery.on_timer(now, &self.directory, &mut self.rng);
        let local_id = self.local_id();

        // 같은 scope의 NACK 항목은 한 레코드로
        let mut nacks: Vec<(u8, Vec<NackEntry>)> = Vec::new();

        for action in actions {
            match action {
                RecoveryAction::SendNack { scope, entry } => {
                    match nacks.iter_mut().find(|(s, _)| *s == scope) {
                        Some((_, entries)) => entries.push(entry),
                        None => nacks.push((scope, vec![entry])),
                    }
                }
                RecoveryAction::SyncError {
                    source,
                    cause,
                    seqno,
                } => self.resync(source, cause, seqno, now),
                RecoveryAction::SendReply {
                    scope,
                    reply,
                    seqnos,
                } => {
                    let buf = encode(scope, local_id, &Record::NackReply(vec![reply]));
                    self.send(&buf, scope);
                    self.queue_repairs(reply.source, &seqnos, reply.to, scope);
                }
            }
        }

        for (scope, entries) in nacks {
            self.stats.nacks_sent += entries.len() as u64;
            debug!("NACK 송신 @{}: {:?}", scope, entries);
            let record = Record::Nack(Nack {
                timestamp: self.clock.ntp32(),
                entries,
            });
            let buf = encode(scope, local_id, &record);
            self.send(&buf, scope);
        }

        self.rearm_recovery();
    }

    /// 보고 타이머: 참여자 정리 후 기한이 된 보고를 한 데이터그램으로 송신
    pub(crate) fn on_report_timer(&mut self, now: Instant) {
        self.prune(now);

        let local_id = self.local_id();
        let ttl = self.ttl;
        let mut buf = BytesMut::new();

        if now >= self.reports.next_sr {
            if let Some(sr) = self.sender_report() {
                encode_record(&mut buf, ttl, local_id, &Record::SenderReport(sr));
            }
            self.reports.next_sr = now + self.sr_interval(now);
        }

        if now >= self.reports.next_rs {
            if let Some(rs) = self.rr_selection(now) {
                encode_record(&mut buf, ttl, local_id, &Record::RrSelection(rs));
            }
            self.reports.next_rs = now + self.reports.rs_interval;
        }

        let entries = self.receiver_reports(now);
        if !entries.is_empty() {
            encode_record(&mut buf, ttl, local_id, &Record::ReceiverReport(entries));
        }

        if !buf.is_empty() {
            self.send(&buf, ttl);
        }
        self.schedule_report(now);
    }

    /// 첫 송신 직후 즉시 SR
    pub(crate) fn send_sender_report(&mut self, now: Instant) {
        if let Some(sr) = self.sender_report() {
            let buf = encode(self.ttl, self.local_id(), &Record::SenderReport(sr));
            self.send(&buf, self.ttl);
        }
        self.reports.next_sr = now + self.sr_interval(now);
        self.schedule_report(now);
    }

    /// 가장 이른 보고 시각으로 타이머 예약
    pub(crate) fn schedule_report(&self, now: Instant) {
        let next_rr = self
            .directory
            .source_ids()
            .into_iter()
            .filter_map(|id| self.directory.source(id).and_then(|s| s.next_rr_time))
            .min();

        let mut at = self.reports.next_sr.min(self.reports.next_rs);
        if let Some(rr) = next_rr {
            at = at.min(rr);
        }
        self.scheduler.schedule(TimerKind::Report, at.max(now));
    }

    fn prune(&mut self, now: Instant) {
        self.directory.prune(RCV_DROP_TIME, now);
        for id in self.directory.take_evicted() {
            info!("소스 종료: {:08x}", id);
            self.recovery.remove_source(id);
            emit(&self.events, SessionEvent::EndOfSequence(id));
        }
    }

    /// 송신한 적이 있고 너무 오래 쉬지 않았을 때만 SR
    ///
    /// 수신자와 같은 방식으로 로컬 송신 간격도 갱신한다 (로컬 NACK 중복 판정에 사용).
    fn sender_report(&mut self) -> Option<SenderReport> {
        let now = self.clock.now();
        let timestamp = self.clock.ntp32();
        let local = self.directory.local_mut();
        let last = local.last_time_for_data?;
        if now.saturating_duration_since(last) >= SND_DROP_TIME {
            return None;
        }
        let sr = SenderReport {
            timestamp,
            seqno: local.expected,
            packets: local.packets as u32,
            bytes: local.bytes as u32,
        };
        estimate_rate(local, &sr);
        Some(sr)
    }

    /// 데이터가 멈추면 SR 간격을 쉰 시간만큼 늘린다
    fn sr_interval(&self, now: Instant) -> Duration {
        let base = Duration::from_millis(self.config.sender_report_interval_ms);
        let idle = self
            .directory
            .local()
            .last_time_for_data
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
        idle.max(base).max(MIN_SR_INTERVAL)
    }

    /// 새 RR-Selection (송신자만). 직전 선택의 응답 수로 수신자 수를 추정한다.
    fn rr_selection(&mut self, now: Instant) -> Option<RrSelection> {
        let policy = self.config.rr_selection;
        let timestamp = self.clock.ntp32();
        let local = self.directory.local_mut();
        if policy == ReceiverReportPolicy::None || local.packets == 0 {
            return None;
        }

        if local.rr_select_time.is_some() {
            let replies = local.rr_replies as u64;
            self.stats.population = if local.rr_prob == 0 {
                replies as u32 + 1
            } else {
                ((replies << 16) / local.rr_prob as u64 + 1) as u32
            };
        }

        let probability = match policy {
            ReceiverReportPolicy::Random => {
                ((RR_TARGET_REPLIES << 16) / (self.stats.population as u64 + 1)).min(0xffff) as u16
            }
            _ => 0,
        };

        local.rr_timestamp = timestamp;
        local.rr_prob = probability as u32;
        local.rr_replies = 0;
        local.rr_select_time = Some(now);

        debug!(
            "RR-Selection: prob {:#06x}, 추정 수신자 {}",
            probability, self.stats.population
        );
        Some(RrSelection {
            timestamp,
            probability,
            period_secs: RR_PERIOD_SECS,
            targets: Vec::new(),
        })
    }

    /// 기한이 된 소스별 RR 항목
    fn receiver_reports(&mut self, now: Instant) -> Vec<ReceiverReportEntry> {
        let mut entries = Vec::new();

        for id in self.directory.source_ids() {
            let Some(source) = self.directory.source_mut(id) else {
                continue;
            };
            match source.next_rr_time {
                Some(at) if at <= now => {}
                _ => continue,
            }

            entries.push(report_entry(source, now));

            source.rr_abs_lost = source.abs_lost();
            source.rr_max_seqno = source.maxseq;
            // 확률 0이면 주기적 보고
            let period = Duration::from_millis(source.rr_interval_ms.max(1000) as u64);
            source.next_rr_time = (source.rr_prob == 0).then(|| now + period);
        }

        entries
    }
}

/// 연속한 두 SR 사이의 전송률과 패킷 간격
fn estimate_rate(source: &mut SourceRecord, sr: &SenderReport) {
    if let Some(prev) = source.sr_timestamp {
        let elapsed_ms = fixed32_to_millis(sr.timestamp.wrapping_sub(prev) as i64);
        if elapsed_ms > 0 {
            let bytes = sr.bytes.wrapping_sub(source.sr_bytes as u32) as i64;
            let packets = sr.packets.wrapping_sub(source.sr_packets as u32) as i64;
            source.rate = (bytes * 1000 / elapsed_ms).min(u32::MAX as i64) as u32;
            if packets > 0 {
                source.interval_ms = (elapsed_ms / packets) as u32;
            }
        }
    }
    source.sr_timestamp = Some(sr.timestamp);
    source.sr_seqno = sr.seqno;
    source.sr_packets = sr.packets as u64;
    source.sr_bytes = sr.bytes as u64;
}

fn report_entry(source: &SourceRecord, now: Instant) -> ReceiverReportEntry {
    let abs_lost = source.abs_lost();
    let expected_interval = seq_diff(source.maxseq, source.rr_max_seqno) as i64;
    let lost_interval = abs_lost - source.rr_abs_lost;
    let loss_rate = if expected_interval <= 0 || lost_interval <= 0 {
        0
    } else {
        ((lost_interval << 8) / expected_interval).min(0xff) as u8
    };

    let delay = source
        .rr_select_time
        .map_or(0, |t| duration_to_fixed32(now.saturating_duration_since(t)));

    ReceiverReportEntry {
        target: source.id(),
        timestamp: source.rr_timestamp,
        delay,
        expected: source.expected,
        loss_rate,
        abs_lost: abs_lost.clamp(0, 0x00ff_ffff) as u32,
    }
}
