//! 세션 설정 (프로파일)

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 신뢰성 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reliability {
    /// 손실 허용: 복구를 시도하지 않음
    LossAllowed,
    /// 제한적 손실: 재시도 횟수를 절반으로 제한
    LimitedLoss,
    /// 무손실: 전체 재시도 예산 사용
    NoLoss,
}

/// 전송률 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Throughput {
    /// pacing 없이 최대 속도
    BestEffort,
    /// 고정 전송률 (적응 없음)
    Constant,
    /// NACK 신호 기반 적응
    Adapted,
}

/// 수신자 보고(RR) 선택 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverReportPolicy {
    None,
    /// 확률적으로 선택된 수신자만 1회 보고
    Random,
    /// 선택된 수신자가 주기적으로 보고
    Periodic,
}

/// 최대 NACK 재시도 횟수
pub const MAX_NACK_TRIES: u32 = 8;

/// SMCast 세션 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 세션 TTL (최상위 복구 도메인 scope)
    pub ttl: u8,

    /// 송신 윈도우 (로컬 송신 캐시 크기, 패킷 수)
    pub send_window_size: usize,

    /// 수신 윈도우 (소스별 수신 캐시 크기, 패킷 수)
    pub rcv_window_size: usize,

    /// 최소 전송률 (kbit/s)
    pub min_rate_kbps: u32,

    /// 최대 전송률 (kbit/s)
    pub max_rate_kbps: u32,

    pub reliability: Reliability,

    pub throughput: Throughput,

    pub rr_selection: ReceiverReportPolicy,

    /// 수신 패킷을 캐시해 로컬 복구에 참여할지 여부
    pub send_repair: bool,

    /// Sender Report 주기 (밀리초)
    pub sender_report_interval_ms: u64,

    /// RR-Selection 주기 (밀리초)
    pub rr_select_interval_ms: u64,

    /// 송신 큐 크기
    pub send_queue_size: usize,

    /// 난수 시드 (None이면 OS 엔트로피)
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl: 63,
            send_window_size: 64,
            rcv_window_size: 64,
            min_rate_kbps: 8,
            max_rate_kbps: 64,
            reliability: Reliability::NoLoss,
            throughput: Throughput::Adapted,
            rr_selection: ReceiverReportPolicy::Random,
            send_repair: true,
            sender_report_interval_ms: 4000,
            rr_select_interval_ms: 30000,
            send_queue_size: 1000,
            rng_seed: None,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 로컬 네트워크용 설정
    pub fn lan() -> Self {
        Self {
            ttl: 15,
            send_window_size: 256,
            rcv_window_size: 256,
            min_rate_kbps: 64,
            max_rate_kbps: 10_000,
            ..Self::default()
        }
    }

    /// 광역 세션용 설정 (전체 도메인 체인 사용)
    pub fn wide_area() -> Self {
        Self {
            ttl: 127,
            send_window_size: 512,
            rcv_window_size: 512,
            min_rate_kbps: 16,
            max_rate_kbps: 1_000,
            ..Self::default()
        }
    }

    /// pacing 없는 best-effort 설정
    pub fn best_effort() -> Self {
        Self {
            throughput: Throughput::BestEffort,
            reliability: Reliability::LimitedLoss,
            ..Self::default()
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.ttl == 0 {
            return Err(Error::InvalidConfig("ttl must be positive".into()));
        }
        if self.send_window_size == 0 || self.rcv_window_size == 0 {
            return Err(Error::InvalidConfig("window size must be positive".into()));
        }
        if self.send_queue_size == 0 {
            return Err(Error::InvalidConfig("send queue size must be positive".into()));
        }
        Ok(())
    }

    /// 최소 전송률 (bytes/sec)
    pub fn min_rate(&self) -> u32 {
        if self.min_rate_kbps == 0 {
            125
        } else {
            self.min_rate_kbps.saturating_mul(1000) / 8
        }
    }

    /// 최대 전송률 (bytes/sec), 최소 전송률 이상으로 보정
    pub fn max_rate(&self) -> u32 {
        let max = self.max_rate_kbps.saturating_mul(1000) / 8;
        max.max(self.min_rate())
    }

    /// 전송률 재계산 주기 (패킷 수)
    pub fn check_interval(&self) -> u64 {
        ((self.send_window_size / 8) as u64).max(4)
    }

    /// 손실 복구 생략 여부
    pub fn loss_allowed(&self) -> bool {
        self.reliability == Reliability::LossAllowed
    }

    /// NACK 재시도 예산
    pub fn max_nack_tries(&self) -> u32 {
        match self.reliability {
            Reliability::LimitedLoss => MAX_NACK_TRIES / 2,
            _ => MAX_NACK_TRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_conversion() {
        let config = Config::default();
        assert_eq!(config.min_rate(), 1000);
        assert_eq!(config.max_rate(), 8000);

        let config = Config {
            min_rate_kbps: 0,
            max_rate_kbps: 0,
            ..Config::default()
        };
        assert_eq!(config.min_rate(), 125);
        assert_eq!(config.max_rate(), 125);
    }

    #[test]
    fn test_check_interval_floor() {
        let mut config = Config::default();
        assert_eq!(config.check_interval(), 8);
        config.send_window_size = 16;
        assert_eq!(config.check_interval(), 4);
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());
        let config = Config {
            ttl: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_budget() {
        assert_eq!(Config::default().max_nack_tries(), 8);
        assert_eq!(Config::best_effort().max_nack_tries(), 4);
        let config = Config {
            reliability: Reliability::LossAllowed,
            ..Config::default()
        };
        assert!(config.loss_allowed());
    }
}
