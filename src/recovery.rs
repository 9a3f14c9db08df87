//! 손실 복구 엔진
//!
//! 도메인 체인(바깥 → 안쪽), 공유 손실 테이블과 이력을 소유한다.
//!
//! - 새 손실은 가장 안쪽의 활성 도메인에서 시작
//! - NACK 타이머는 지수 백오프 + 난수화
//! - 같은 scope에서 실패하면 부모 도메인으로 확장, 부분 복구되면 자식 도메인으로 축소
//! - 다른 수신자의 NACK/복구를 엿듣고 중복 NACK과 중복 복구를 억제

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info};

use crate::clock::duration_to_fixed32;
use crate::codec::{NackEntry, NackReplyEntry};
use crate::domain::{Domain, DISABLE_TRIES, MAX_DISABLE_TIME, SCOPE_BREAKPOINTS};
use crate::entity::{SourceDirectory, SourceRecord, RCV_DROP_TIME};
use crate::loss::{ErrorCause, LossEvent, LossHistory, LossTable, NextAction, BITMASK_SPAN};
use crate::packet::seq_diff;

/// 부분 복구 후 자식 도메인으로 내려갈 간격 기준
const GO_DOWN_PROXIMITY: i32 = 33;

/// 송신 간격 가산 상한 (밀리초)
const MAX_INTERVAL_BONUS_MS: u64 = 200;

/// 로컬 손실 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossOutcome {
    /// 간격이 캐시를 넘어 복구 불가
    Overrun,
    /// 새 손실 이벤트 생성
    Created,
    /// 기존 이벤트 갱신
    Refreshed,
}

/// 수신 NACK 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackResponse {
    /// 로컬 소스: 캐시에 있는 시퀀스를 즉시 재전송
    Resend { seqnos: Vec<u32>, scope: u8 },
    /// 제3자 응답 예약됨
    ReplyScheduled,
    Ignored,
}

/// 타이머 만료로 생긴 동작
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    SendNack {
        scope: u8,
        entry: NackEntry,
    },
    SyncError {
        source: u32,
        cause: ErrorCause,
        /// 포기한 첫 시퀀스
        seqno: u32,
    },
    /// 제3자 복구: NACK-Reply 후 재전송
    SendReply {
        scope: u8,
        reply: NackReplyEntry,
        seqnos: Vec<u32>,
    },
}

/// 손실 복구 엔진
#[derive(Debug)]
pub struct RecoveryEngine {
    /// 0 = 루트 (세션 TTL), 인덱스가 클수록 좁은 scope
    domains: Vec<Domain>,
    table: LossTable,
    history: LossHistory,
    local_id: u32,
    max_tries: u32,
}

impl RecoveryEngine {
    /// TTL 경계값 {ttl, 63, 47, 15} 중 ttl 미만인 것만으로 체인 구성
    pub fn new(ttl: u8, local_id: u32, max_tries: u32, now: Instant) -> Self {
        let mut domains = vec![Domain::new(ttl, now)];
        domains.extend(
            SCOPE_BREAKPOINTS
                .iter()
                .filter(|&&bp| ttl > bp)
                .map(|&bp| Domain::new(bp, now)),
        );

        debug!(
            "도메인 체인: {:?}",
            domains.iter().map(|d| d.ttl).collect::<Vec<_>>()
        );

        Self {
            domains,
            table: LossTable::new(),
            history: LossHistory::new(),
            local_id,
            max_tries,
        }
    }

    pub fn ttl(&self) -> u8 {
        self.domains[0].ttl
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn domain(&self, i: usize) -> &Domain {
        &self.domains[i]
    }

    pub fn table(&self) -> &LossTable {
        &self.table
    }

    fn parent(&self, i: usize) -> Option<usize> {
        i.checked_sub(1)
    }

    fn child(&self, i: usize) -> Option<usize> {
        (i + 1 < self.domains.len()).then_some(i + 1)
    }

    /// 활성화: 이미 활성인 조상을 만날 때까지 부모 방향으로 전파
    pub fn enable(&mut self, i: usize, now: Instant) {
        for d in self.domains[..=i].iter_mut().rev() {
            if d.enabled {
                break;
            }
            d.enabled = true;
            d.failed_nack = 0;
            d.last_toggle = now;
            info!("도메인 활성화: scope={}", d.scope);
        }
    }

    /// 비활성화: 자식 방향으로 전파. 루트는 비활성화되지 않음.
    pub fn disable(&mut self, i: usize, now: Instant) {
        if i == 0 {
            return;
        }
        for d in self.domains[i..].iter_mut() {
            if !d.enabled {
                break;
            }
            d.enabled = false;
            d.last_toggle = now;
            info!("도메인 비활성화: scope={} fails={}", d.scope, d.failed_nack);
        }
    }

    /// 실패 누적/비활성 시간에 따라 상태 전환
    pub fn check_state(&mut self, i: usize, now: Instant) {
        if i == 0 {
            return;
        }
        let d = &self.domains[i];
        if d.enabled {
            if d.failed_nack > DISABLE_TRIES {
                self.disable(i, now);
            }
        } else if now.saturating_duration_since(d.last_toggle) >= MAX_DISABLE_TIME {
            self.enable(i, now);
        }
    }

    /// 가장 안쪽의 활성 도메인
    pub fn get_domain(&mut self, now: Instant) -> usize {
        for i in (0..self.domains.len()).rev() {
            self.check_state(i, now);
            if self.domains[i].enabled {
                return i;
            }
        }
        0
    }

    /// scope를 포함하는 가장 안쪽 도메인 (없으면 루트)
    pub fn lookup_domain(&self, scope: u8) -> usize {
        (0..self.domains.len())
            .rev()
            .find(|&i| self.domains[i].ttl >= scope)
            .unwrap_or(0)
    }

    /// scope에 해당하는 도메인의 RTT 갱신
    pub fn update_rtt(&mut self, scope: u8, rtt_ms: i64) {
        let i = self.lookup_domain(scope);
        self.domains[i].update_mrtt(rtt_ms);
    }

    /// 재전송 통계
    pub fn record_repair(&mut self, scope: u8, bytes: usize) {
        let i = self.lookup_domain(scope);
        self.domains[i].repair_packets += 1;
        self.domains[i].repair_bytes += bytes as u64;
    }

    pub fn lookup(&self, source: u32, reporter: u32) -> Option<&LossEvent> {
        self.table.lookup(source, reporter)
    }

    pub fn lookup_mut(&mut self, source: u32, reporter: u32) -> Option<&mut LossEvent> {
        self.table.lookup_mut(source, reporter)
    }

    /// 가장 이른 타이머 마감
    pub fn next_timeout(&self) -> Option<Instant> {
        self.table.next_timeout()
    }

    /// 진행 중인 이벤트와 이력 모두 제거
    pub fn clear(&mut self) {
        self.table.clear();
        self.history.clear();
    }

    /// 내 손실 이벤트 포기 (재동기화 전)
    pub fn cancel_loss(&mut self, source: u32) -> Option<LossEvent> {
        self.table.remove(source, self.local_id)
    }

    /// 사라진 소스의 이벤트 제거
    pub fn remove_source(&mut self, source: u32) {
        self.table.remove_where(|e| e.source == source);
    }

    /// 로컬 손실 처리: (소스, 나) 이벤트가 없으면 만들고 NACK 타이머 예약
    pub fn handle_loss<R: Rng + ?Sized>(
        &mut self,
        source: &SourceRecord,
        now: Instant,
        rng: &mut R,
    ) -> LossOutcome {
        let diff = seq_diff(source.maxseq, source.expected);
        if diff > source.cache_size() as i32 {
            return LossOutcome::Overrun;
        }

        if let Some(ev) = self.table.lookup_mut(source.id(), self.local_id) {
            // 데이터가 계속 도착 중이면 소스는 살아 있다
            ev.nack_count = ev.nack_count.saturating_sub(1);
            ev.next_action = NextAction::SendNack;
            return LossOutcome::Refreshed;
        }

        let d = self.get_domain(now);
        let mut ev = LossEvent::new(source.id(), self.local_id, now);
        ev.scope = self.domains[d].scope;
        ev.domain = d;
        ev.compute_bitmask(source);
        ev.timeout = now + self.nack_delay(&ev, source.interval_ms, rng);

        debug!(
            "새 손실 {:08x}: low={:?} mask={:#x} scope={} timeout={:?}",
            ev.source,
            ev.low,
            ev.bitmask,
            ev.scope,
            ev.timeout.saturating_duration_since(now)
        );
        self.table.add(ev);
        LossOutcome::Created
    }

    /// NACK 백오프 타이머 값
    ///
    /// `rtt << nack_count`를 초기 RTT 이상으로 올리고 [1, 2) 배 난수화한다.
    /// 재시도이거나 자식 도메인이 활성이면 소스 송신 간격(최대 200ms)을 더한다.
    pub fn nack_delay<R: Rng + ?Sized>(
        &self,
        ev: &LossEvent,
        interval_ms: u32,
        rng: &mut R,
    ) -> Duration {
        let d = &self.domains[ev.domain];
        let mut ms = ((d.mrtt as u64) << ev.nack_count.min(16)) >> 3;
        ms = ms.max(d.initial_mrtt as u64);
        ms = (ms as f64 * (1.0 + rng.gen::<f64>())) as u64;

        let child_enabled = self
            .child(ev.domain)
            .map_or(false, |c| self.domains[c].enabled);
        if ev.nack_count > 0 || child_enabled {
            ms += (interval_ms as u64).min(MAX_INTERVAL_BONUS_MS);
        }

        Duration::from_millis(ms)
    }

    /// 최근 이력에 이미 같은 손실 보고가 있는지 확인하고 이력 갱신
    ///
    /// 시간 창은 `도메인 RTT + min(송신 간격, 200ms)`.
    pub fn is_duplicate(
        &mut self,
        domain: usize,
        ev: &LossEvent,
        interval_ms: u32,
        now: Instant,
    ) -> bool {
        let slice = Duration::from_millis(
            self.domains[domain].rtt_ms() as u64
                + (interval_ms as u64).min(MAX_INTERVAL_BONUS_MS),
        );

        let duplicate = self.history.iter().any(|h| {
            h.source == ev.source
                && now.saturating_duration_since(h.received_at) < slice
                && h.covers(ev)
        });
        if duplicate {
            return true;
        }

        let mut recorded = ev.clone();
        recorded.received_at = now;
        if !self.history.replace_where(&recorded, |h| ev.covers(h)) {
            self.history.push(recorded);
        }
        false
    }

    /// 다른 참여자의 NACK 처리
    ///
    /// - 내 대기 중 이벤트를 덮고 보고자 ID가 더 작으면 내 NACK을 미룬다
    /// - 내가 소스면 캐시에 있는 것을 재전송
    /// - 제3자면 제공 가능한 부분만 응답 이벤트로 예약
    pub fn process_nack<R: Rng + ?Sized>(
        &mut self,
        ev: LossEvent,
        source: &SourceRecord,
        send_repair: bool,
        now: Instant,
        rng: &mut R,
    ) -> NackResponse {
        let local_id = self.local_id;

        if let Some(own) = self.table.lookup_mut(ev.source, local_id) {
            if local_id > ev.reporter && ev.covers(own) {
                debug!("NACK 억제 {:08x}: {:08x}가 이미 보고", ev.source, ev.reporter);
                own.next_action = NextAction::DelayAndStay;
            }
        }

        if ev.is_repaired() {
            return NackResponse::Ignored;
        }

        let domain = self.lookup_domain(ev.scope);

        if ev.source == local_id {
            if self.is_duplicate(domain, &ev, source.interval_ms, now) {
                debug!("중복 NACK 무시: low={:?} from {:08x}", ev.low, ev.reporter);
                return NackResponse::Ignored;
            }
            let seqnos: Vec<u32> = ev.missing().filter(|&s| source.is_cached(s)).collect();
            if seqnos.is_empty() {
                return NackResponse::Ignored;
            }
            return NackResponse::Resend {
                seqnos,
                scope: ev.scope,
            };
        }

        if !send_repair || self.table.lookup(ev.source, ev.reporter).is_some() {
            return NackResponse::Ignored;
        }
        if self.is_duplicate(domain, &ev, source.interval_ms, now) {
            return NackResponse::Ignored;
        }

        let servable: Vec<u32> = ev.missing().filter(|&s| source.is_cached(s)).collect();
        let Some(reply) = subset_event(&ev, &servable, domain, now) else {
            return NackResponse::Ignored;
        };

        let rtt = self.domains[domain].rtt_ms().max(1) as f64;
        let delay = Duration::from_millis((rtt * (1.0 + rng.gen::<f64>())) as u64);

        let mut reply = reply;
        reply.timeout = now + delay;
        debug!(
            "제3자 복구 예약 {:08x} -> {:08x}: {}개, {:?} 후",
            reply.source,
            reply.reporter,
            servable.len(),
            delay
        );
        self.table.add(reply);
        NackResponse::ReplyScheduled
    }

    /// 다른 응답자의 NACK-Reply 처리
    ///
    /// 같은 (소스, 보고자)에 대한 내 응답 예약이 있으면 취소하고 true.
    pub fn process_nack_reply(&mut self, reply: &NackReplyEntry) -> bool {
        let local_id = self.local_id;

        if let Some(own) = self.table.lookup_mut(reply.source, local_id) {
            let announced = LossEvent::from_nack(
                reply.source,
                reply.to,
                reply.low,
                reply.bitmask,
                own.scope,
                reply.timestamp,
                own.received_at,
            );
            if reply.to == local_id || announced.covers(own) {
                own.next_action = NextAction::DelayAndStay;
            }
        }

        if reply.to == local_id {
            return false;
        }

        match self.table.remove(reply.source, reply.to) {
            Some(_) => {
                debug!(
                    "응답 예약 취소 {:08x} -> {:08x}: 다른 응답자가 처리",
                    reply.source, reply.to
                );
                true
            }
            None => false,
        }
    }

    /// 엿들은 복구 패킷으로 내 응답 예약에서 해당 시퀀스 제거
    pub fn heard_repair(&mut self, source: u32, seqno: u32) {
        let local_id = self.local_id;
        for ev in self
            .table
            .iter_mut()
            .filter(|e| e.source == source && e.reporter != local_id)
        {
            ev.clear_seqno(seqno);
        }
        self.table
            .remove_where(|e| e.source == source && e.reporter != local_id && e.is_repaired());
    }

    /// 복구 패킷 수신 후 내 손실 이벤트 갱신
    pub fn after_repair(&mut self, source: &SourceRecord, seqno: u32) {
        let Some(ev) = self.table.lookup_mut(source.id(), self.local_id) else {
            return;
        };

        ev.compute_bitmask(source);
        match ev.low {
            None => {
                let domain = ev.domain;
                self.table.remove(source.id(), self.local_id);
                self.domains[domain].failed_nack = 0;
                debug!("손실 복구 완료 {:08x}", source.id());
            }
            Some(low) => {
                ev.next_action = if seq_diff(seqno, low).abs() < GO_DOWN_PROXIMITY {
                    NextAction::DelayAndGoDown
                } else {
                    NextAction::DelayAndStay
                };
            }
        }
    }

    /// 마감된 이벤트 처리 (마감 순)
    pub fn on_timer<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        directory: &SourceDirectory,
        rng: &mut R,
    ) -> Vec<RecoveryAction> {
        let mut actions = Vec::new();

        for (src, reporter) in self.table.due(now) {
            let Some(mut ev) = self.table.remove(src, reporter) else {
                continue;
            };

            if reporter != self.local_id {
                if let Some(action) = reply_action(&ev, directory, now) {
                    actions.push(action);
                }
                continue;
            }

            let Some(source) = directory.source(src) else {
                actions.push(RecoveryAction::SyncError {
                    source: src,
                    cause: ErrorCause::SenderGone,
                    seqno: ev.low.unwrap_or_default(),
                });
                continue;
            };

            ev.compute_bitmask(source);
            let Some(low) = ev.low else {
                continue;
            };

            if source.peer.silence(now) >= RCV_DROP_TIME {
                actions.push(RecoveryAction::SyncError {
                    source: src,
                    cause: ErrorCause::SenderLost,
                    seqno: low,
                });
                continue;
            }

            if ev.nack_count >= self.max_tries {
                actions.push(RecoveryAction::SyncError {
                    source: src,
                    cause: ErrorCause::MaxTriesReached,
                    seqno: low,
                });
                continue;
            }

            match ev.next_action {
                NextAction::DelayAndStay => {}
                NextAction::DelayAndGoDown => {
                    if let Some(c) = self.child(ev.domain).filter(|&c| self.domains[c].enabled) {
                        ev.domain = c;
                        ev.scope = self.domains[c].scope;
                        ev.nack_count = 1;
                    }
                }
                NextAction::DelayAndGoUp => {
                    self.escalate(&mut ev, source.peer.distance);
                }
                NextAction::SendNack => {
                    actions.push(RecoveryAction::SendNack {
                        scope: ev.scope,
                        entry: NackEntry {
                            source: src,
                            low,
                            bitmask: ev.bitmask,
                        },
                    });
                    self.domains[ev.domain].nacks += 1;
                    self.escalate(&mut ev, source.peer.distance);
                }
            }

            ev.next_action = NextAction::SendNack;
            ev.timeout = now + self.nack_delay(&ev, source.interval_ms, rng);
            debug!(
                "NACK 타이머 {:08x}: #{} scope={} {:?}",
                src,
                ev.nack_count,
                ev.scope,
                ev.timeout.saturating_duration_since(now)
            );
            self.table.add(ev);
        }

        actions
    }

    /// 소스까지의 거리보다 scope가 좁으면 부모 도메인으로, 아니면 재시도 횟수 증가
    fn escalate(&mut self, ev: &mut LossEvent, distance: u8) {
        match self.parent(ev.domain) {
            Some(p) if ev.scope < distance => {
                self.domains[ev.domain].failed_nack += 1;
                ev.domain = p;
                ev.scope = self.domains[p].scope;
            }
            _ => ev.nack_count += 1,
        }
    }
}

/// 제공 가능한 시퀀스만으로 응답 이벤트 구성
fn subset_event(ev: &LossEvent, seqnos: &[u32], domain: usize, now: Instant) -> Option<LossEvent> {
    let (&low, rest) = seqnos.split_first()?;
    let mut bitmask = 0u32;
    for &s in rest {
        let d = seq_diff(s, low);
        if (1..=BITMASK_SPAN).contains(&d) {
            bitmask |= 1 << (d - 1);
        }
    }

    let mut reply = LossEvent::from_nack(
        ev.source,
        ev.reporter,
        low,
        bitmask,
        ev.scope,
        ev.timestamp,
        ev.received_at,
    );
    reply.domain = domain;
    reply.timeout = now;
    Some(reply)
}

/// 응답 이벤트 만료: 아직 캐시에 있는 것만 NACK-Reply + 재전송
fn reply_action(ev: &LossEvent, directory: &SourceDirectory, now: Instant) -> Option<RecoveryAction> {
    let source = directory.source(ev.source)?;
    let seqnos: Vec<u32> = ev.missing().filter(|&s| source.is_cached(s)).collect();
    let sub = subset_event(ev, &seqnos, ev.domain, now)?;

    Some(RecoveryAction::SendReply {
        scope: ev.scope,
        reply: NackReplyEntry {
            to: ev.reporter,
            timestamp: ev.timestamp,
            delay: duration_to_fixed32(now.saturating_duration_since(ev.received_at)),
            source: ev.source,
            low: sub.low?,
            bitmask: sub.bitmask,
        },
        seqnos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PeerRecord;
    use crate::packet::Packet;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::{IpAddr, Ipv4Addr};

    const ME: u32 = 100;
    const SRC: u32 = 9;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn directory(now: Instant) -> SourceDirectory {
        let mut me = PeerRecord::new(ME, ip(100));
        me.touch(now);
        let mut dir = SourceDirectory::new(SourceRecord::new(me, 5000, 64), 64);
        dir.lookup(SRC, ip(9), now);
        dir.lookup_sender(SRC, ip(9), 100, now).unwrap();
        dir
    }

    fn cache(source: &mut SourceRecord, seqnos: &[u32]) {
        for &s in seqnos {
            let mut p = Packet::reliable(vec![0u8; 4]);
            p.seqno = s;
            p.source = source.id();
            source.put_packet(p);
            source.observe_seqno(s);
        }
    }

    #[test]
    fn test_domain_chain() {
        let now = Instant::now();
        let ttls = |ttl| {
            RecoveryEngine::new(ttl, ME, 8, now)
                .domains()
                .iter()
                .map(|d| d.ttl)
                .collect::<Vec<_>>()
        };
        assert_eq!(ttls(200), vec![200, 63, 47, 15]);
        assert_eq!(ttls(63), vec![63, 47, 15]);
        assert_eq!(ttls(20), vec![20, 15]);
        assert_eq!(ttls(15), vec![15]);
    }

    #[test]
    fn test_domain_cascade() {
        let now = Instant::now();
        let mut r = RecoveryEngine::new(200, ME, 8, now);

        r.disable(2, now);
        let enabled: Vec<bool> = r.domains().iter().map(|d| d.enabled).collect();
        assert_eq!(enabled, vec![true, true, false, false]);

        r.enable(3, now);
        assert!(r.domains().iter().all(|d| d.enabled));

        // 루트는 비활성화되지 않음
        r.disable(0, now);
        assert!(r.domain(0).enabled);
    }

    #[test]
    fn test_check_state_disable_and_reenable() {
        let now = Instant::now();
        let mut r = RecoveryEngine::new(63, ME, 8, now);
        assert_eq!(r.get_domain(now), 2);

        r.domains[2].failed_nack = DISABLE_TRIES + 1;
        assert_eq!(r.get_domain(now), 1);
        assert!(!r.domain(2).enabled);

        assert_eq!(r.get_domain(now + Duration::from_secs(179)), 1);
        assert_eq!(r.get_domain(now + Duration::from_secs(180)), 2);
        assert_eq!(r.domain(2).failed_nack, 0);
    }

    #[test]
    fn test_lookup_domain() {
        let r = RecoveryEngine::new(127, ME, 8, Instant::now());
        assert_eq!(r.lookup_domain(15), 3);
        assert_eq!(r.lookup_domain(16), 2);
        assert_eq!(r.lookup_domain(63), 1);
        assert_eq!(r.lookup_domain(127), 0);
        assert_eq!(r.lookup_domain(255), 0);
    }

    #[test]
    fn test_duplicate_suppression_window() {
        let now = Instant::now();
        let mut r = RecoveryEngine::new(15, ME, 8, now);
        let interval = 64;
        // 12ms + 64ms
        let slice = Duration::from_millis(76);

        let a = LossEvent::from_nack(SRC, 1, 10, 0x1, 15, 0, now);
        let b = LossEvent::from_nack(SRC, 2, 10, 0x1, 15, 0, now);

        assert!(!r.is_duplicate(0, &a, interval, now));
        assert!(r.is_duplicate(0, &b, interval, now + Duration::from_millis(10)));
        assert!(!r.is_duplicate(0, &b, interval, now + slice));
    }

    #[test]
    fn test_handle_loss_single_event() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(1);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(63, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[101, 102]);

        assert_eq!(r.handle_loss(src, now, &mut rng), LossOutcome::Created);
        let ev = r.lookup(SRC, ME).unwrap();
        assert_eq!(ev.low, Some(100));
        assert_eq!(ev.bitmask, 0);
        assert_eq!(ev.scope, 15);
        assert_eq!(ev.domain, 2);

        r.lookup_mut(SRC, ME).unwrap().nack_count = 2;
        assert_eq!(r.handle_loss(src, now, &mut rng), LossOutcome::Refreshed);
        assert_eq!(r.lookup(SRC, ME).unwrap().nack_count, 1);
        assert_eq!(r.table().len(), 1);

        src.maxseq = 100 + 65;
        assert_eq!(r.handle_loss(src, now, &mut rng), LossOutcome::Overrun);
    }

    #[test]
    fn test_nack_delay_bounds() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(3);
        let r = RecoveryEngine::new(15, ME, 8, now);
        let mut ev = LossEvent::new(SRC, ME, now);

        for _ in 0..50 {
            let d = r.nack_delay(&ev, 500, &mut rng).as_millis();
            assert!((12..24).contains(&d), "delay {}", d);
        }

        ev.nack_count = 2;
        for _ in 0..50 {
            let d = r.nack_delay(&ev, 500, &mut rng).as_millis();
            // 48 * [1, 2) + 200
            assert!((248..296).contains(&d), "delay {}", d);
        }
    }

    #[test]
    fn test_timer_sends_nack_and_escalates() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(63, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[101]);
        r.handle_loss(src, now, &mut rng);

        let t1 = now + Duration::from_secs(1);
        let actions = r.on_timer(t1, &dir, &mut rng);
        assert_eq!(
            actions,
            vec![RecoveryAction::SendNack {
                scope: 15,
                entry: NackEntry {
                    source: SRC,
                    low: 100,
                    bitmask: 0
                }
            }]
        );
        assert_eq!(r.domain(2).nacks, 1);
        assert_eq!(r.domain(2).failed_nack, 1);

        let ev = r.lookup(SRC, ME).unwrap();
        assert_eq!(ev.scope, 47);
        assert_eq!(ev.nack_count, 0);
        assert!(ev.timeout > t1);
    }

    #[test]
    fn test_max_tries_raises_sync_error() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(15, ME, 4, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[101]);
        r.handle_loss(src, now, &mut rng);

        let mut t = now;
        let mut nacks = 0;
        let mut errors = Vec::new();
        for _ in 0..10 {
            t += Duration::from_secs(5);
            for a in r.on_timer(t, &dir, &mut rng) {
                match a {
                    RecoveryAction::SendNack { .. } => nacks += 1,
                    RecoveryAction::SyncError { cause, .. } => errors.push(cause),
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        assert_eq!(nacks, 4);
        assert_eq!(errors, vec![ErrorCause::MaxTriesReached]);
        assert!(r.lookup(SRC, ME).is_none());
    }

    #[test]
    fn test_repaired_event_dropped_on_timer() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(15, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[101]);
        r.handle_loss(src, now, &mut rng);

        src.expected = 102;
        let actions = r.on_timer(now + Duration::from_secs(1), &dir, &mut rng);
        assert!(actions.is_empty());
        assert!(r.table().is_empty());
    }

    #[test]
    fn test_overheard_nack_suppresses_own() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(15, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[101]);
        r.handle_loss(src, now, &mut rng);

        // 더 큰 ID의 보고는 억제하지 않음
        let theirs = LossEvent::from_nack(SRC, 200, 100, 0, 15, 0, now);
        r.process_nack(theirs, src, true, now, &mut rng);
        assert_eq!(r.lookup(SRC, ME).unwrap().next_action, NextAction::SendNack);

        let theirs = LossEvent::from_nack(SRC, 50, 100, 0b1, 15, 0, now);
        r.process_nack(theirs, src, true, now, &mut rng);
        assert_eq!(
            r.lookup(SRC, ME).unwrap().next_action,
            NextAction::DelayAndStay
        );
    }

    #[test]
    fn test_source_resends_cached() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(63, ME, 8, now);

        let me = dir.local_mut();
        cache(me, &[5000, 5001, 5002]);

        let nack = LossEvent::from_nack(ME, 7, 5001, 0b11, 47, 0, now);
        let resp = r.process_nack(nack, dir.local(), true, now, &mut rng);
        assert_eq!(
            resp,
            NackResponse::Resend {
                seqnos: vec![5001, 5002],
                scope: 47
            }
        );

        // 같은 손실의 반복 보고는 무시
        let again = LossEvent::from_nack(ME, 8, 5001, 0b11, 47, 0, now);
        assert_eq!(
            r.process_nack(again, dir.local(), true, now, &mut rng),
            NackResponse::Ignored
        );
    }

    #[test]
    fn test_third_party_reply() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(15, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[100, 101, 103]);
        src.expected = 102;

        // 보고자 7이 100..=103 누락 보고, 나는 100, 101, 103 보유
        let nack = LossEvent::from_nack(SRC, 7, 100, 0b111, 15, 0x1234, now);
        assert_eq!(
            r.process_nack(nack, dir.source(SRC).unwrap(), true, now, &mut rng),
            NackResponse::ReplyScheduled
        );

        let actions = r.on_timer(now + Duration::from_secs(1), &dir, &mut rng);
        match &actions[..] {
            [RecoveryAction::SendReply {
                scope,
                reply,
                seqnos,
            }] => {
                assert_eq!(*scope, 15);
                assert_eq!(reply.to, 7);
                assert_eq!(reply.timestamp, 0x1234);
                assert_eq!(reply.low, 100);
                assert_eq!(reply.bitmask, 0b101);
                assert_eq!(seqnos, &vec![100, 101, 103]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(r.table().is_empty());
    }

    #[test]
    fn test_reply_cancelled_by_other_responder() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(15, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[100]);

        let nack = LossEvent::from_nack(SRC, 7, 100, 0, 15, 0, now);
        r.process_nack(nack, dir.source(SRC).unwrap(), true, now, &mut rng);
        assert!(r.lookup(SRC, 7).is_some());

        let reply = NackReplyEntry {
            to: 7,
            timestamp: 0,
            delay: 0,
            source: SRC,
            low: 100,
            bitmask: 0,
        };
        assert!(r.process_nack_reply(&reply));
        assert!(r.lookup(SRC, 7).is_none());
    }

    #[test]
    fn test_heard_repair_prunes_reply() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(15, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[100, 101]);

        let nack = LossEvent::from_nack(SRC, 7, 100, 0b1, 15, 0, now);
        r.process_nack(nack, dir.source(SRC).unwrap(), true, now, &mut rng);

        r.heard_repair(SRC, 100);
        assert_eq!(r.lookup(SRC, 7).unwrap().low, Some(101));
        r.heard_repair(SRC, 101);
        assert!(r.lookup(SRC, 7).is_none());
    }

    #[test]
    fn test_after_repair() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(63, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[102]);
        r.handle_loss(src, now, &mut rng);
        r.domains[2].failed_nack = 3;

        // 100 복구, 101은 여전히 누락
        src.expected = 101;
        r.after_repair(src, 100);
        assert_eq!(
            r.lookup(SRC, ME).unwrap().next_action,
            NextAction::DelayAndGoDown
        );

        src.expected = 103;
        r.after_repair(src, 101);
        assert!(r.lookup(SRC, ME).is_none());
        assert_eq!(r.domain(2).failed_nack, 0);
    }

    #[test]
    fn test_close_repair_falls_back_to_child_domain() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(63, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[102]);
        r.handle_loss(src, now, &mut rng);

        // 첫 NACK 후 47 scope로 확장
        let t1 = now + Duration::from_secs(1);
        assert_eq!(r.on_timer(t1, &dir, &mut rng).len(), 1);
        assert_eq!(r.lookup(SRC, ME).unwrap().domain, 1);

        // 100만 복구되어 손실 근처의 복구가 보임
        let src = dir.source_mut(SRC).unwrap();
        src.expected = 101;
        r.after_repair(src, 100);
        assert_eq!(
            r.lookup(SRC, ME).unwrap().next_action,
            NextAction::DelayAndGoDown
        );

        let actions = r.on_timer(now + Duration::from_secs(10), &dir, &mut rng);
        assert!(actions.is_empty());
        let ev = r.lookup(SRC, ME).unwrap();
        assert_eq!(ev.domain, 2);
        assert_eq!(ev.scope, 15);
        assert_eq!(ev.nack_count, 1);
        assert_eq!(ev.low, Some(101));
        assert_eq!(ev.next_action, NextAction::SendNack);
        assert_eq!(r.domain(2).nacks, 1);
    }

    #[test]
    fn test_go_up_widens_scope_without_nack() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(5);
        let mut dir = directory(now);
        let mut r = RecoveryEngine::new(63, ME, 8, now);

        let src = dir.source_mut(SRC).unwrap();
        cache(src, &[101]);
        r.handle_loss(src, now, &mut rng);
        r.lookup_mut(SRC, ME).unwrap().next_action = NextAction::DelayAndGoUp;

        let actions = r.on_timer(now + Duration::from_secs(1), &dir, &mut rng);
        assert!(actions.is_empty());
        let ev = r.lookup(SRC, ME).unwrap();
        assert_eq!((ev.domain, ev.scope, ev.nack_count), (1, 47, 0));
        assert_eq!(r.domain(2).nacks, 0);
        assert_eq!(r.domain(2).failed_nack, 1);

        // 소스까지 거리가 이미 scope 안이면 재시도 횟수만 증가
        dir.peer_mut(SRC).unwrap().distance = 47;
        r.lookup_mut(SRC, ME).unwrap().next_action = NextAction::DelayAndGoUp;
        let actions = r.on_timer(now + Duration::from_secs(10), &dir, &mut rng);
        assert!(actions.is_empty());
        let ev = r.lookup(SRC, ME).unwrap();
        assert_eq!((ev.domain, ev.scope, ev.nack_count), (1, 47, 1));
    }
}
