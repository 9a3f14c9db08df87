//! 손실 이벤트와 손실 테이블
//!
//! 손실 이벤트는 `low` + 32비트 비트마스크로 누락 시퀀스를 표현한다.
//! `low` 자체는 항상 누락이고, 비트 i는 `low + i + 1`의 누락을 뜻한다.

use std::collections::VecDeque;
use std::time::Instant;

use crate::entity::SourceRecord;
use crate::packet::seq_diff;

/// 손실 이력 크기
pub const HISTORY_SIZE: usize = 16;

/// 비트마스크가 표현하는 최대 범위
pub const BITMASK_SPAN: i32 = 32;

/// 복구 불가 손실 원인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCause {
    /// 간격이 캐시 크기를 넘음
    BufferOverrun,
    /// NACK 재시도 예산 소진
    MaxTriesReached,
    /// 소스가 오래 침묵
    SenderLost,
    /// 소스가 테이블에서 사라짐
    SenderGone,
}

/// 타이머 만료 시 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    SendNack,
    DelayAndStay,
    DelayAndGoUp,
    DelayAndGoDown,
}

/// 하나의 (소스, 보고자) 손실 상태
#[derive(Debug, Clone)]
pub struct LossEvent {
    pub source: u32,
    pub reporter: u32,
    /// 첫 누락 시퀀스 (None = 손실 없음)
    pub low: Option<u32>,
    /// 마지막 누락 시퀀스 + 1
    pub high: u32,
    pub bitmask: u32,
    pub scope: u8,
    /// 도메인 체인 인덱스 (0 = 루트)
    pub domain: usize,
    pub nack_count: u32,
    pub next_action: NextAction,
    pub timeout: Instant,
    /// 생성(또는 NACK 수신) 시각
    pub received_at: Instant,
    /// NACK의 NTP32 타임스탬프
    pub timestamp: u32,
}

impl LossEvent {
    pub fn new(source: u32, reporter: u32, now: Instant) -> Self {
        Self {
            source,
            reporter,
            low: None,
            high: 0,
            bitmask: 0,
            scope: 0,
            domain: 0,
            nack_count: 0,
            next_action: NextAction::SendNack,
            timeout: now,
            received_at: now,
            timestamp: 0,
        }
    }

    /// 수신 NACK 항목으로 생성
    pub fn from_nack(
        source: u32,
        reporter: u32,
        low: u32,
        bitmask: u32,
        scope: u8,
        timestamp: u32,
        now: Instant,
    ) -> Self {
        let mut ev = Self::new(source, reporter, now);
        ev.set_range(low, bitmask);
        ev.scope = scope;
        ev.timestamp = timestamp;
        ev
    }

    fn set_range(&mut self, low: u32, bitmask: u32) {
        self.low = Some(low);
        self.bitmask = bitmask;
        let top = 32 - bitmask.leading_zeros();
        self.high = low.wrapping_add(top + 1);
    }

    /// 소스의 수신 상태에서 누락 범위 계산
    ///
    /// `expected`부터 최대 32개 뒤까지 캐시에 없는 시퀀스를 표시한다.
    pub fn compute_bitmask(&mut self, source: &SourceRecord) {
        let low = source.expected;
        let maxdiff = seq_diff(source.maxseq, low);

        if maxdiff < 0 {
            self.low = None;
            self.bitmask = 0;
            return;
        }

        let mut bitmask = 0u32;
        for i in 1..=maxdiff.min(BITMASK_SPAN) {
            if !source.is_cached(low.wrapping_add(i as u32)) {
                bitmask |= 1 << (i - 1);
            }
        }
        self.set_range(low, bitmask);
    }

    pub fn is_repaired(&self) -> bool {
        self.low.is_none()
    }

    /// `seqno`가 이 이벤트의 누락 범위에 포함되는지
    pub fn contains_seqno(&self, seqno: u32) -> bool {
        let Some(low) = self.low else {
            return false;
        };
        match seq_diff(seqno, low) {
            0 => true,
            d @ 1..=BITMASK_SPAN => self.bitmask & (1 << (d - 1)) != 0,
            _ => false,
        }
    }

    /// 누락 시퀀스 순회 (low 포함)
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        let low = self.low;
        let bitmask = self.bitmask;
        low.into_iter().flat_map(move |low| {
            std::iter::once(low).chain(
                (0..32u32)
                    .filter(move |i| bitmask & (1 << i) != 0)
                    .map(move |i| low.wrapping_add(i + 1)),
            )
        })
    }

    /// `other`의 누락 시퀀스를 모두 포함하는지
    pub fn covers(&self, other: &LossEvent) -> bool {
        if self.source != other.source || self.low.is_none() {
            return false;
        }
        other.missing().all(|s| self.contains_seqno(s))
    }

    /// 누락 시퀀스 제거 (복구됨). 모두 제거되면 true.
    pub fn clear_seqno(&mut self, seqno: u32) -> bool {
        let Some(low) = self.low else {
            return true;
        };
        let d = seq_diff(seqno, low);
        if d == 0 {
            // 다음 누락을 새 low로
            let next = self.missing().nth(1);
            match next {
                Some(next) => {
                    let shift = seq_diff(next, low) as u32;
                    let bitmask = if shift >= 32 { 0 } else { self.bitmask >> shift };
                    self.set_range(next, bitmask);
                }
                None => self.low = None,
            }
        } else if (1..=BITMASK_SPAN).contains(&d) {
            self.bitmask &= !(1 << (d - 1));
            self.set_range(low, self.bitmask);
        }
        self.low.is_none()
    }
}

/// 진행 중인 손실 이벤트 목록 (도메인 체인 전체가 공유)
#[derive(Debug, Default)]
pub struct LossTable {
    events: Vec<LossEvent>,
}

impl LossTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, source: u32, reporter: u32) -> Option<&LossEvent> {
        self.events
            .iter()
            .find(|e| e.source == source && e.reporter == reporter)
    }

    pub fn lookup_mut(&mut self, source: u32, reporter: u32) -> Option<&mut LossEvent> {
        self.events
            .iter_mut()
            .find(|e| e.source == source && e.reporter == reporter)
    }

    /// 추가 (같은 (소스, 보고자)가 있으면 교체)
    pub fn add(&mut self, ev: LossEvent) {
        self.remove(ev.source, ev.reporter);
        self.events.push(ev);
    }

    pub fn remove(&mut self, source: u32, reporter: u32) -> Option<LossEvent> {
        let i = self
            .events
            .iter()
            .position(|e| e.source == source && e.reporter == reporter)?;
        Some(self.events.remove(i))
    }

    /// 조건에 맞는 이벤트 모두 제거
    pub fn remove_where(&mut self, mut f: impl FnMut(&LossEvent) -> bool) -> Vec<LossEvent> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.events.len() {
            if f(&self.events[i]) {
                removed.push(self.events.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &LossEvent> {
        self.events.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LossEvent> {
        self.events.iter_mut()
    }

    /// 마감이 `now` 이전인 이벤트 키를 마감 순으로
    pub fn due(&self, now: Instant) -> Vec<(u32, u32)> {
        let mut due: Vec<_> = self.events.iter().filter(|e| e.timeout <= now).collect();
        due.sort_by_key(|e| e.timeout);
        due.into_iter().map(|e| (e.source, e.reporter)).collect()
    }

    /// 가장 이른 마감
    pub fn next_timeout(&self) -> Option<Instant> {
        self.events.iter().map(|e| e.timeout).min()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// 최근 관측한 손실 보고 이력 (중복 복구 억제용)
#[derive(Debug)]
pub struct LossHistory {
    entries: VecDeque<LossEvent>,
}

impl Default for LossHistory {
    fn default() -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY_SIZE),
        }
    }
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LossEvent> {
        self.entries.iter()
    }

    /// 이력 추가 (가득 차면 가장 오래된 것 제거)
    pub fn push(&mut self, ev: LossEvent) {
        if self.entries.len() >= HISTORY_SIZE {
            self.entries.pop_front();
        }
        self.entries.push_back(ev);
    }

    /// 조건에 맞는 첫 항목을 새 이벤트로 교체. 교체했으면 true.
    pub fn replace_where(&mut self, ev: &LossEvent, f: impl Fn(&LossEvent) -> bool) -> bool {
        match self.entries.iter_mut().find(|h| f(h)) {
            Some(h) => {
                *h = ev.clone();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PeerRecord;
    use crate::packet::Packet;
    use std::net::{IpAddr, Ipv4Addr};

    fn source_with(expected: u32, maxseq: u32, cached: &[u32]) -> SourceRecord {
        let peer = PeerRecord::new(9, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let mut s = SourceRecord::new(peer, expected, 64);
        s.maxseq = maxseq;
        for &seq in cached {
            let mut p = Packet::reliable(vec![0u8]);
            p.seqno = seq;
            s.put_packet(p);
        }
        s
    }

    #[test]
    fn test_compute_bitmask() {
        let s = source_with(100, 105, &[100, 102, 104, 105]);
        let mut ev = LossEvent::new(9, 1, Instant::now());
        ev.compute_bitmask(&s);

        assert_eq!(ev.low, Some(100));
        assert_eq!(ev.bitmask, 0b101);
        assert_eq!(ev.high, 104);
        assert_eq!(ev.missing().collect::<Vec<_>>(), vec![100, 101, 103]);
    }

    #[test]
    fn test_compute_bitmask_no_loss() {
        let s = source_with(100, 99, &[]);
        let mut ev = LossEvent::new(9, 1, Instant::now());
        ev.compute_bitmask(&s);
        assert!(ev.is_repaired());
        assert_eq!(ev.missing().count(), 0);
    }

    #[test]
    fn test_compute_bitmask_caps_at_32() {
        let s = source_with(0, 100, &[]);
        let mut ev = LossEvent::new(9, 1, Instant::now());
        ev.compute_bitmask(&s);
        assert_eq!(ev.bitmask, u32::MAX);
        assert_eq!(ev.high, 33);
    }

    #[test]
    fn test_covers() {
        let now = Instant::now();
        let wide = LossEvent::from_nack(9, 2, 10, 0b111, 15, 0, now);
        let narrow = LossEvent::from_nack(9, 3, 11, 0b1, 15, 0, now);
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));

        let other_source = LossEvent::from_nack(8, 3, 11, 0b1, 15, 0, now);
        assert!(!wide.covers(&other_source));
    }

    #[test]
    fn test_clear_seqno() {
        let now = Instant::now();
        let mut ev = LossEvent::from_nack(9, 2, 10, 0b101, 15, 0, now);

        assert!(!ev.clear_seqno(13));
        assert_eq!(ev.bitmask, 0b001);

        assert!(!ev.clear_seqno(10));
        assert_eq!(ev.low, Some(11));
        assert_eq!(ev.bitmask, 0);

        assert!(ev.clear_seqno(11));
    }

    #[test]
    fn test_table_one_event_per_pair() {
        let now = Instant::now();
        let mut table = LossTable::new();
        table.add(LossEvent::new(9, 1, now));
        table.add(LossEvent::new(9, 1, now));
        table.add(LossEvent::new(9, 2, now));
        assert_eq!(table.len(), 2);
        assert!(table.lookup(9, 2).is_some());
        assert!(table.remove(9, 1).is_some());
        assert!(table.lookup(9, 1).is_none());
    }

    #[test]
    fn test_history_bounded() {
        let now = Instant::now();
        let mut history = LossHistory::new();
        for i in 0..20 {
            history.push(LossEvent::from_nack(9, i, i, 0, 15, 0, now));
        }
        assert_eq!(history.len(), HISTORY_SIZE);
        assert_eq!(history.iter().next().unwrap().reporter, 4);
    }
}
