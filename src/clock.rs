//! 시간 소스와 NTP 고정소수점 변환
//!
//! 프로토콜 상태(침묵 시간, 도메인 토글, NACK 타이머)는 모두 주입된 [`Clock`]을 통해
//! 시간을 읽는다. 테스트에서는 [`ManualClock`]으로 시간을 직접 진행시킨다.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// 1900-01-01 ~ 1970-01-01 (초)
pub const NTP_OFFSET_SECONDS: u64 = 2_208_988_800;

/// 시간 소스
pub trait Clock: Send + Sync {
    /// 단조 증가 시각
    fn now(&self) -> Instant;

    /// UNIX 시각 (밀리초)
    fn unix_millis(&self) -> u64;

    /// 현재 시각의 32비트 NTP 표현
    fn ntp32(&self) -> u32 {
        ntp32(self.unix_millis())
    }
}

/// 시스템 시계
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// 수동으로 진행시키는 시계 (결정적 테스트용)
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_unix_millis: u64,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_unix_millis: 1_700_000_000_000,
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// 시간 진행
    pub fn advance(&self, d: Duration) {
        *self.elapsed.lock() += d;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.elapsed.lock()
    }

    fn unix_millis(&self) -> u64 {
        self.base_unix_millis + self.elapsed.lock().as_millis() as u64
    }
}

/// UNIX 밀리초를 32비트 NTP 시각으로 변환
///
/// 상위 16비트는 초, 하위 16비트는 1/65536초 단위 소수부.
pub fn ntp32(unix_millis: u64) -> u32 {
    let millis = unix_millis + NTP_OFFSET_SECONDS * 1000;
    ((millis << 16) / 1000) as u32
}

/// 밀리초 → 32비트 고정소수점 (1/65536초 단위)
///
/// `millis * 2^16 / 1000`을 `2^16/1000 = 2^6 + 2 - 58/125`로 분해해 계산한다.
pub fn millis_to_fixed32(millis: i64) -> i64 {
    (millis << 6) + (millis << 1) - millis * 58 / 125
}

/// 32비트 고정소수점 → 밀리초
pub fn fixed32_to_millis(fixed: i64) -> i64 {
    let fixed = fixed - (fixed >> 7) * 3;
    (fixed + (1 << 5)) >> 6
}

/// 경과 시간을 고정소수점으로 (와이어용 32비트)
pub fn duration_to_fixed32(d: Duration) -> u32 {
    millis_to_fixed32(d.as_millis() as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_round_trip() {
        for m in [0i64, 1, 500, 86_400_000] {
            let back = fixed32_to_millis(millis_to_fixed32(m));
            assert!((back - m).abs() <= 1, "m={} back={}", m, back);
        }
    }

    #[test]
    fn test_fixed_point_scale() {
        // 1초 = 0x10000
        assert_eq!(millis_to_fixed32(1000), 0x10000);
        assert_eq!(fixed32_to_millis(0x10000), 1000);
    }

    #[test]
    fn test_ntp32_epoch() {
        // UNIX epoch의 NTP 초는 상위 16비트에 잘린 값으로 들어간다
        let t = ntp32(0);
        assert_eq!(t >> 16, (NTP_OFFSET_SECONDS & 0xffff) as u32);
        assert_eq!(t & 0xffff, 0);

        let half = ntp32(500);
        assert_eq!(half & 0xffff, 0x8000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        let u0 = clock.unix_millis();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - t0, Duration::from_millis(1500));
        assert_eq!(clock.unix_millis() - u0, 1500);
    }
}
