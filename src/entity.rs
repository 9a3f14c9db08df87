//! 세션 참여자 테이블
//!
//! - PeerRecord: 와이어에서 들은 모든 참여자의 기본 정보
//! - SourceRecord: 데이터를 보내는 참여자 (시퀀스 추적 + 패킷 캐시)
//! - SourceDirectory: ID → 참여자 매핑, 침묵 시간 기반 정리

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::PacketCache;
use crate::packet::{seq_diff, Packet};

/// 수신자 정리 기준 침묵 시간
pub const RCV_DROP_TIME: Duration = Duration::from_secs(60);

/// 무조건 정리 기준 침묵 시간
pub const SND_DROP_TIME: Duration = Duration::from_secs(600);

/// 테이블 최대 크기
pub const MAX_ENTITIES: usize = 128;

/// 송신 간격 기본값 (128kbps에서 1KB 패킷)
const DEFAULT_INTERVAL_MS: u32 = 64;

/// 참여자 기본 정보
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: u32,
    pub addr: IpAddr,
    pub last_heard: Option<Instant>,
    /// 왕복 시간 추정 (밀리초)
    pub rtt_ms: u32,
    /// 대략적인 홉 거리 (수신 scope의 최솟값)
    pub distance: u8,
    pub nack_count: u32,
}

impl PeerRecord {
    pub fn new(id: u32, addr: IpAddr) -> Self {
        Self {
            id,
            addr,
            last_heard: None,
            rtt_ms: 0,
            distance: u8::MAX,
            nack_count: 0,
        }
    }

    /// 주소 재바인딩/재사용 시 상태 초기화
    pub fn reset(&mut self) {
        self.nack_count = 0;
        self.last_heard = None;
        self.distance = u8::MAX;
    }

    /// 마지막 수신 이후 침묵 시간 (들은 적 없으면 무한대)
    pub fn silence(&self, now: Instant) -> Duration {
        match self.last_heard {
            Some(t) => now.saturating_duration_since(t),
            None => Duration::MAX,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_heard = Some(now);
    }
}

/// 데이터 소스 상태
#[derive(Debug)]
pub struct SourceRecord {
    pub peer: PeerRecord,
    pub cache: PacketCache,

    pub startseq: u32,
    /// 수신한 최대 시퀀스
    pub maxseq: u32,
    /// 다음에 전달할 시퀀스
    pub expected: u32,
    pub lastseq: u32,
    /// 마지막 동기화 에러 위치 (연속 손실당 이벤트 1회)
    pub last_error: Option<u32>,

    pub packets: u64,
    pub bytes: u64,
    pub duplicates: u64,
    pub repairs: u64,
    pub third_party_repairs: u64,

    /// 추정 전송률 (bytes/sec)
    pub rate: u32,
    /// 추정 송신 간격 (밀리초)
    pub interval_ms: u32,
    pub last_time_for_data: Option<Instant>,

    // Sender Report
    pub next_sr_time: Option<Instant>,
    pub sr_timestamp: Option<u32>,
    pub sr_seqno: u32,
    pub sr_packets: u64,
    pub sr_bytes: u64,

    // Receiver Report
    pub rr_abs_lost: i64,
    pub rr_max_seqno: u32,
    pub rr_timestamp: u32,
    pub rr_prob: u32,
    pub rr_interval_ms: u32,
    pub rr_select_time: Option<Instant>,
    pub rr_replies: u32,
    pub next_rr_time: Option<Instant>,
}

impl SourceRecord {
    pub fn new(peer: PeerRecord, initial_seqno: u32, cache_size: usize) -> Self {
        let mut s = Self {
            peer,
            cache: PacketCache::new(cache_size),
            startseq: initial_seqno,
            maxseq: initial_seqno.wrapping_sub(1),
            expected: initial_seqno,
            lastseq: initial_seqno.wrapping_sub(1),
            last_error: None,
            packets: 0,
            bytes: 0,
            duplicates: 0,
            repairs: 0,
            third_party_repairs: 0,
            rate: 0,
            interval_ms: DEFAULT_INTERVAL_MS,
            last_time_for_data: None,
            next_sr_time: None,
            sr_timestamp: None,
            sr_seqno: initial_seqno,
            sr_packets: 0,
            sr_bytes: 0,
            rr_abs_lost: 0,
            rr_max_seqno: initial_seqno.wrapping_sub(1),
            rr_timestamp: 0,
            rr_prob: 0,
            rr_interval_ms: 0,
            rr_select_time: None,
            rr_replies: 0,
            next_rr_time: None,
        };
        s.clear_cache(initial_seqno);
        s
    }

    pub fn id(&self) -> u32 {
        self.peer.id
    }

    /// 캐시를 비우고 시퀀스 추적을 `seqno`부터 다시 시작
    pub fn clear_cache(&mut self, seqno: u32) {
        self.startseq = seqno;
        self.maxseq = seqno.wrapping_sub(1);
        self.expected = seqno;
        self.lastseq = self.maxseq;
        self.rr_abs_lost = 0;
        self.rr_max_seqno = self.maxseq;
        self.cache.clear();
    }

    /// 캐시 크기 (복구 가능한 최대 순서 역전 깊이)
    pub fn cache_size(&self) -> usize {
        self.cache.capacity()
    }

    pub fn is_cached(&self, seqno: u32) -> bool {
        self.cache.contains(seqno)
    }

    pub fn get_packet(&self, seqno: u32) -> Option<&Packet> {
        self.cache.get(seqno)
    }

    pub fn put_packet(&mut self, packet: Packet) {
        self.cache.add(packet);
    }

    /// `seqno`가 maxseq보다 앞서면 갱신
    pub fn observe_seqno(&mut self, seqno: u32) {
        if seq_diff(seqno, self.maxseq) > 0 {
            self.maxseq = seqno;
        }
    }

    /// 누적 손실 (수신 범위 - 실제 수신)
    pub fn abs_lost(&self) -> i64 {
        let range = seq_diff(self.maxseq, self.startseq) as i64 + 1;
        range - (self.packets as i64 - self.duplicates as i64)
    }
}

/// 참여자 항목: 일반 피어 또는 소스
#[derive(Debug)]
pub enum PeerEntry {
    Peer(PeerRecord),
    Source(Box<SourceRecord>),
}

impl PeerEntry {
    pub fn peer(&self) -> &PeerRecord {
        match self {
            PeerEntry::Peer(p) => p,
            PeerEntry::Source(s) => &s.peer,
        }
    }

    pub fn peer_mut(&mut self) -> &mut PeerRecord {
        match self {
            PeerEntry::Peer(p) => p,
            PeerEntry::Source(s) => &mut s.peer,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, PeerEntry::Source(_))
    }

    pub fn as_source(&self) -> Option<&SourceRecord> {
        match self {
            PeerEntry::Source(s) => Some(&**s),
            PeerEntry::Peer(_) => None,
        }
    }

    pub fn as_source_mut(&mut self) -> Option<&mut SourceRecord> {
        match self {
            PeerEntry::Source(s) => Some(&mut **s),
            PeerEntry::Peer(_) => None,
        }
    }

    /// 피어를 소스로 승격 (공통 필드 유지). 이미 소스면 그대로 반환.
    pub fn upgrade_to_source(
        &mut self,
        initial_seqno: u32,
        cache_size: usize,
    ) -> Option<&mut SourceRecord> {
        if let PeerEntry::Peer(p) = self {
            let source = SourceRecord::new(p.clone(), initial_seqno, cache_size);
            *self = PeerEntry::Source(Box::new(source));
        }
        self.as_source_mut()
    }
}

/// 참여자 테이블
///
/// 로컬 참여자("whoami")는 항상 소스이고 정리 대상이 아니므로 별도로 보관한다.
#[derive(Debug)]
pub struct SourceDirectory {
    local: Box<SourceRecord>,
    entries: HashMap<u32, PeerEntry>,
    capacity: usize,
    rcv_cache_size: usize,
    evicted: Vec<u32>,
}

impl SourceDirectory {
    pub fn new(local: SourceRecord, rcv_cache_size: usize) -> Self {
        Self {
            local: Box::new(local),
            entries: HashMap::new(),
            capacity: MAX_ENTITIES,
            rcv_cache_size,
            evicted: Vec::new(),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local.id()
    }

    pub fn local(&self) -> &SourceRecord {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut SourceRecord {
        &mut self.local
    }

    /// 로컬 포함 참여자 수
    pub fn len(&self) -> usize {
        self.entries.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// 패킷 출처 확인
    ///
    /// 수락된 참여자 ID를 반환하고, 거부하면 None.
    pub fn lookup(&mut self, id: u32, addr: IpAddr, now: Instant) -> Option<u32> {
        if id == self.local.id() {
            return (self.local.peer.addr == addr).then_some(id);
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.peer().addr == addr {
                return Some(id);
            }
            // 소스 ID는 다른 주소로 재할당되지 않는다
            if entry.is_source() {
                return None;
            }
            if entry.peer().silence(now) < RCV_DROP_TIME {
                return None;
            }
            let peer = entry.peer_mut();
            debug!("피어 주소 재바인딩: {:08x} {} -> {}", id, peer.addr, addr);
            peer.addr = addr;
            peer.reset();
            return Some(id);
        }

        // 같은 주소에서 새 ID로 재참여한 경우
        let rejoined = self
            .entries
            .iter()
            .find(|(_, e)| {
                !e.is_source() && e.peer().addr == addr && e.peer().silence(now) >= RCV_DROP_TIME
            })
            .map(|(old, _)| *old);

        if let Some(old) = rejoined {
            if let Some(mut entry) = self.entries.remove(&old) {
                debug!("재참여 피어: {:08x} -> {:08x} @{}", old, id, addr);
                let peer = entry.peer_mut();
                peer.id = id;
                peer.reset();
                self.add(id, entry, now);
                return Some(id);
            }
        }

        let mut peer = PeerRecord::new(id, addr);
        peer.touch(now);
        self.add(id, PeerEntry::Peer(peer), now);
        Some(id)
    }

    /// 데이터 패킷용 엄격한 조회 (ID와 주소 모두 일치)
    pub fn demux(&self, id: u32, addr: IpAddr) -> Option<&PeerEntry> {
        self.entries.get(&id).filter(|e| e.peer().addr == addr)
    }

    /// 소스 확인: 필요하면 피어를 소스로 승격하거나 새로 만든다
    pub fn lookup_sender(
        &mut self,
        id: u32,
        addr: IpAddr,
        seqno: u32,
        now: Instant,
    ) -> Option<&mut SourceRecord> {
        if id == self.local.id() {
            return None;
        }

        let cache_size = self.rcv_cache_size;
        if self.entries.contains_key(&id) {
            // 다른 주소의 기존 참여자는 대체하지 않는다
            if self.demux(id, addr).is_none() {
                debug!("소스 주소 불일치: {:08x} @{}", id, addr);
                return None;
            }
        } else {
            let mut peer = PeerRecord::new(id, addr);
            peer.touch(now);
            let source = SourceRecord::new(peer, seqno, cache_size);
            self.add(id, PeerEntry::Source(Box::new(source)), now);
        }

        let entry = self.entries.get_mut(&id)?;
        if !entry.is_source() {
            debug!("소스 승격: {:08x} seq={}", id, seqno);
        }
        entry.upgrade_to_source(seqno, cache_size)
    }

    fn add(&mut self, id: u32, entry: PeerEntry, now: Instant) {
        let mut max_silence = RCV_DROP_TIME;
        while self.len() > self.capacity {
            self.prune(max_silence, now);
            if max_silence > Duration::from_secs(10) {
                max_silence -= Duration::from_secs(10);
            } else {
                break;
            }
        }
        self.entries.insert(id, entry);
    }

    /// 침묵한 참여자 정리
    ///
    /// 수신 전용 피어는 `max_silence`, 소스는 [`SND_DROP_TIME`] 이후 제거된다.
    /// 제거된 소스 ID는 [`take_evicted`](Self::take_evicted)로 꺼낸다.
    pub fn prune(&mut self, max_silence: Duration, now: Instant) {
        let evicted = &mut self.evicted;
        self.entries.retain(|id, e| {
            let silence = e.peer().silence(now);
            let drop = silence >= SND_DROP_TIME || (!e.is_source() && silence >= max_silence);
            if drop {
                debug!("참여자 정리: {:08x} (침묵 {:?})", id, silence);
                if e.is_source() {
                    evicted.push(*id);
                }
            }
            !drop
        });
    }

    /// 정리되어 사라진 소스 목록
    pub fn take_evicted(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.evicted)
    }

    pub fn remove(&mut self, id: u32) -> Option<PeerEntry> {
        let entry = self.entries.remove(&id)?;
        if entry.is_source() {
            self.evicted.push(id);
        }
        Some(entry)
    }

    pub fn get(&self, id: u32) -> Option<&PeerEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut PeerEntry> {
        self.entries.get_mut(&id)
    }

    /// 로컬 포함 피어 조회
    pub fn peer(&self, id: u32) -> Option<&PeerRecord> {
        if id == self.local.id() {
            return Some(&self.local.peer);
        }
        self.entries.get(&id).map(PeerEntry::peer)
    }

    pub fn peer_mut(&mut self, id: u32) -> Option<&mut PeerRecord> {
        if id == self.local.id() {
            return Some(&mut self.local.peer);
        }
        self.entries.get_mut(&id).map(PeerEntry::peer_mut)
    }

    /// 로컬 포함 소스 조회
    pub fn source(&self, id: u32) -> Option<&SourceRecord> {
        if id == self.local.id() {
            return Some(&self.local);
        }
        self.entries.get(&id).and_then(PeerEntry::as_source)
    }

    pub fn source_mut(&mut self, id: u32) -> Option<&mut SourceRecord> {
        if id == self.local.id() {
            return Some(&mut self.local);
        }
        self.entries.get_mut(&id).and_then(PeerEntry::as_source_mut)
    }

    /// 원격 소스 ID 목록
    pub fn source_ids(&self) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_source())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn directory() -> SourceDirectory {
        let mut me = PeerRecord::new(1, ip(1));
        me.touch(Instant::now());
        SourceDirectory::new(SourceRecord::new(me, 1000, 64), 64)
    }

    #[test]
    fn test_lookup_creates_peer() {
        let mut dir = directory();
        let now = Instant::now();
        assert_eq!(dir.lookup(2, ip(2), now), Some(2));
        assert_eq!(dir.len(), 2);
        assert!(!dir.get(2).unwrap().is_source());
        assert_eq!(dir.lookup(2, ip(2), now), Some(2));
    }

    #[test]
    fn test_source_address_never_reassigned() {
        let mut dir = directory();
        let now = Instant::now();
        dir.lookup(2, ip(2), now);
        dir.lookup_sender(2, ip(2), 50, now).unwrap();

        let later = now + Duration::from_secs(120);
        assert_eq!(dir.lookup(2, ip(9), later), None);
    }

    #[test]
    fn test_lookup_sender_keeps_existing_address() {
        let mut dir = directory();
        let now = Instant::now();
        dir.lookup(2, ip(2), now);
        dir.lookup_sender(2, ip(2), 50, now).unwrap().expected = 52;

        assert!(dir.lookup_sender(2, ip(9), 500, now).is_none());
        let source = dir.source(2).unwrap();
        assert_eq!(source.peer.addr, ip(2));
        assert_eq!(source.expected, 52);

        // 수신 전용 피어도 다른 주소로 승격되지 않음
        dir.lookup(3, ip(3), now);
        assert!(dir.lookup_sender(3, ip(9), 1, now).is_none());
        assert!(!dir.get(3).unwrap().is_source());
    }

    #[test]
    fn test_peer_rebind_after_silence() {
        let mut dir = directory();
        let now = Instant::now();
        dir.lookup(2, ip(2), now);

        assert_eq!(dir.lookup(2, ip(3), now + Duration::from_secs(10)), None);

        let later = now + Duration::from_secs(61);
        assert_eq!(dir.lookup(2, ip(3), later), Some(2));
        assert_eq!(dir.peer(2).unwrap().addr, ip(3));
        assert_eq!(dir.peer(2).unwrap().distance, u8::MAX);
    }

    #[test]
    fn test_rejoin_with_new_id() {
        let mut dir = directory();
        let now = Instant::now();
        dir.lookup(2, ip(2), now);

        let later = now + Duration::from_secs(61);
        assert_eq!(dir.lookup(7, ip(2), later), Some(7));
        assert!(dir.get(2).is_none());
        assert_eq!(dir.peer(7).unwrap().id, 7);
    }

    #[test]
    fn test_upgrade_preserves_peer_fields() {
        let mut dir = directory();
        let now = Instant::now();
        dir.lookup(2, ip(2), now);
        {
            let peer = dir.peer_mut(2).unwrap();
            peer.rtt_ms = 42;
            peer.distance = 15;
        }

        let source = dir.lookup_sender(2, ip(2), 500, now).unwrap();
        assert_eq!(source.peer.rtt_ms, 42);
        assert_eq!(source.peer.distance, 15);
        assert_eq!(source.expected, 500);
        assert_eq!(source.maxseq, 499);
        assert_eq!(source.cache_size(), 64);
    }

    #[test]
    fn test_demux_requires_exact_match() {
        let mut dir = directory();
        let now = Instant::now();
        dir.lookup(2, ip(2), now);
        assert!(dir.demux(2, ip(2)).is_some());
        assert!(dir.demux(2, ip(3)).is_none());
        assert!(dir.demux(3, ip(2)).is_none());
    }

    #[test]
    fn test_prune_policy() {
        let mut dir = directory();
        let now = Instant::now();
        dir.lookup(2, ip(2), now);
        dir.lookup(3, ip(3), now);
        dir.lookup_sender(3, ip(3), 1, now).unwrap();

        dir.prune(RCV_DROP_TIME, now + Duration::from_secs(61));
        assert!(dir.get(2).is_none());
        assert!(dir.get(3).is_some());
        assert!(dir.take_evicted().is_empty());

        dir.prune(RCV_DROP_TIME, now + Duration::from_secs(601));
        assert!(dir.get(3).is_none());
        assert_eq!(dir.take_evicted(), vec![3]);
        // 로컬은 남아 있음
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.source(1).unwrap().id(), 1);
    }

    #[test]
    fn test_capacity_pressure_prunes_silent_peers() {
        let mut dir = directory();
        let start = Instant::now();
        for id in 2..=(MAX_ENTITIES as u32 + 1) {
            dir.lookup(id, IpAddr::V4(Ipv4Addr::from(id)), start);
        }
        assert_eq!(dir.len(), MAX_ENTITIES + 1);

        // 모두 30초 침묵 → 60, 50, 40, 30초 단계에서 정리됨
        let later = start + Duration::from_secs(30);
        dir.lookup(9999, ip(250), later);
        assert!(dir.len() <= MAX_ENTITIES);
        assert!(dir.peer(9999).is_some());
    }

    #[test]
    fn test_abs_lost() {
        let mut s = SourceRecord::new(PeerRecord::new(5, ip(5)), 10, 16);
        s.maxseq = 19;
        s.packets = 8;
        assert_eq!(s.abs_lost(), 2);
    }
}
