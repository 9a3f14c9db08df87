//! 복구 도메인 (scope 경계)
//!
//! 도메인 체인의 각 노드. 체인 연결(부모/자식)과 활성화 전파는
//! [`RecoveryEngine`](crate::recovery::RecoveryEngine)이 인덱스로 관리한다.

use std::time::{Duration, Instant};

use tracing::warn;

/// 비활성 도메인 재활성화까지 시간
pub const MAX_DISABLE_TIME: Duration = Duration::from_secs(180);

/// 이 횟수를 넘게 NACK이 실패하면 비활성화
pub const DISABLE_TRIES: u32 = 5;

pub const MIN_RTT_MS: u32 = 2;
pub const MAX_RTT_MS: u32 = 16_000;

/// TTL 경계값 (바깥 → 안쪽)
pub const SCOPE_BREAKPOINTS: [u8; 3] = [63, 47, 15];

/// 하나의 scope 경계
#[derive(Debug, Clone)]
pub struct Domain {
    pub ttl: u8,
    pub scope: u8,
    pub enabled: bool,
    pub last_toggle: Instant,
    pub failed_nack: u32,
    /// 평활 RTT (밀리초 × 8)
    pub mrtt: u32,
    /// 초기 RTT (밀리초)
    pub initial_mrtt: u32,
    pub nacks: u64,
    pub repair_packets: u64,
    pub repair_bytes: u64,
}

impl Domain {
    pub fn new(ttl: u8, now: Instant) -> Self {
        let initial = initial_mrtt(ttl);
        Self {
            ttl,
            scope: ttl,
            enabled: true,
            last_toggle: now,
            failed_nack: 0,
            mrtt: initial << 3,
            initial_mrtt: initial,
            nacks: 0,
            repair_packets: 0,
            repair_bytes: 0,
        }
    }

    /// 평활 RTT (밀리초)
    pub fn rtt_ms(&self) -> u32 {
        self.mrtt >> 3
    }

    /// RTT 샘플 반영: `mrtt += rtt - mrtt/8`
    pub fn update_mrtt(&mut self, rtt_ms: i64) {
        if rtt_ms < 0 {
            warn!("잘못된 RTT 샘플 무시: {}ms (scope {})", rtt_ms, self.scope);
            return;
        }
        let rtt = (rtt_ms as u32).clamp(MIN_RTT_MS, MAX_RTT_MS);
        self.mrtt = self.mrtt - (self.mrtt >> 3) + rtt;
    }
}

/// TTL에 따른 초기 RTT 추정 (밀리초)
pub fn initial_mrtt(ttl: u8) -> u32 {
    if ttl <= 15 {
        12
    } else if ttl >= 126 {
        800
    } else {
        let t = ttl as u32;
        200 * t * t / 3969 + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_mrtt() {
        assert_eq!(initial_mrtt(1), 12);
        assert_eq!(initial_mrtt(15), 12);
        assert_eq!(initial_mrtt(47), 200 * 47 * 47 / 3969 + 2);
        assert_eq!(initial_mrtt(63), 202);
        assert_eq!(initial_mrtt(126), 800);
        assert_eq!(initial_mrtt(255), 800);
    }

    #[test]
    fn test_update_mrtt() {
        let mut d = Domain::new(63, Instant::now());
        assert_eq!(d.rtt_ms(), 202);

        d.update_mrtt(10);
        assert_eq!(d.mrtt, 202 * 8 - 202 + 10);

        let before = d.mrtt;
        d.update_mrtt(-5);
        assert_eq!(d.mrtt, before);

        // 샘플 상한
        let mut d = Domain::new(15, Instant::now());
        for _ in 0..200 {
            d.update_mrtt(100_000);
        }
        assert!(d.rtt_ms() <= MAX_RTT_MS);
        assert!(d.rtt_ms() > MAX_RTT_MS - 100);
    }
}
