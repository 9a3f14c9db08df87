//! 세션 통계

use std::time::{Duration, Instant};

use crate::domain::Domain;

/// 세션 전체 카운터
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 길이 오류로 버린 레코드/데이터그램
    pub bad_length: u64,
    /// 버전 불일치
    pub bad_version: u64,
    /// 알 수 없는 레코드 타입
    pub bad_type: u64,
    /// 주소 불일치 등으로 거부된 데이터그램
    pub rejected: u64,
    /// 자기 자신이 보낸 패킷 (멀티캐스트 루프백)
    pub loopback: u64,

    pub control_packets: u64,
    pub control_bytes: u64,
    pub data_packets: u64,
    pub data_bytes: u64,
    /// 비신뢰성 패킷
    pub out_of_band: u64,
    pub fec_records: u64,

    pub sender_reports: u64,
    pub receiver_reports: u64,
    pub rr_selections: u64,
    /// 수신자 수 추정
    pub population: u32,

    /// 로컬 송신 (재전송 제외)
    pub packets_sent: u64,
    pub bytes_sent: u64,

    pub nacks_sent: u64,
    pub nacks_received: u64,
    pub repairs_sent: u64,
    pub repair_bytes_sent: u64,
    /// 복구 불가 손실 (애플리케이션 통지 횟수)
    pub failures: u64,
    /// 전송 실패
    pub send_errors: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bad_length: 0,
            bad_version: 0,
            bad_type: 0,
            rejected: 0,
            loopback: 0,
            control_packets: 0,
            control_bytes: 0,
            data_packets: 0,
            data_bytes: 0,
            out_of_band: 0,
            fec_records: 0,
            sender_reports: 0,
            receiver_reports: 0,
            rr_selections: 0,
            population: 1,
            packets_sent: 0,
            bytes_sent: 0,
            nacks_sent: 0,
            nacks_received: 0,
            repairs_sent: 0,
            repair_bytes_sent: 0,
            failures: 0,
            send_errors: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 잘못된 입력 합계
    pub fn malformed(&self) -> u64 {
        self.bad_length + self.bad_version + self.bad_type
    }

    /// 데이터 수신률 (bytes/sec)
    pub fn data_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.data_bytes as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Data: {} pkts / {} bytes | Control: {} pkts | NACKs: {}/{} | Repairs: {} | Failures: {} | Malformed: {} | Population: {}",
            self.elapsed().as_secs_f64(),
            self.data_packets,
            self.data_bytes,
            self.control_packets,
            self.nacks_sent,
            self.nacks_received,
            self.repairs_sent,
            self.failures,
            self.malformed(),
            self.population,
        )
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 도메인별 상태 스냅샷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStats {
    pub scope: u8,
    pub child_scope: Option<u8>,
    pub enabled: bool,
    /// 평활 RTT (밀리초)
    pub rtt_ms: u32,
    pub nacks: u64,
    pub repair_packets: u64,
    pub repair_bytes: u64,
}

impl DomainStats {
    /// 도메인 체인 전체 스냅샷 (바깥 → 안쪽)
    pub fn from_chain(domains: &[Domain]) -> Vec<Self> {
        domains
            .iter()
            .enumerate()
            .map(|(i, d)| Self {
                scope: d.scope,
                child_scope: domains.get(i + 1).map(|c| c.scope),
                enabled: d.enabled,
                rtt_ms: d.rtt_ms(),
                nacks: d.nacks,
                repair_packets: d.repair_packets,
                repair_bytes: d.repair_bytes,
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "scope {:>3} (child {}) {} | rtt {}ms | NACKs: {} | Repairs: {} pkts / {} bytes",
            self.scope,
            self.child_scope
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            if self.enabled { "on " } else { "off" },
            self.rtt_ms,
            self.nacks,
            self.repair_packets,
            self.repair_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_stats_chain() {
        let now = Instant::now();
        let mut chain = vec![Domain::new(63, now), Domain::new(47, now), Domain::new(15, now)];
        chain[2].enabled = false;
        chain[1].nacks = 3;

        let stats = DomainStats::from_chain(&chain);
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].child_scope, Some(47));
        assert_eq!(stats[1].nacks, 3);
        assert_eq!(stats[2].child_scope, None);
        assert!(!stats[2].enabled);
        assert_eq!(stats[2].rtt_ms, 12);
        assert!(stats[2].summary().contains("off"));
    }

    #[test]
    fn test_session_summary() {
        let mut stats = SessionStats::new();
        stats.bad_length = 2;
        stats.bad_type = 1;
        stats.nacks_sent = 4;
        assert_eq!(stats.malformed(), 3);
        assert!(stats.summary().contains("NACKs: 4/0"));
    }
}
