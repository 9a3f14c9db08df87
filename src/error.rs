//! 에러 타입 정의

use thiserror::Error;

/// SMCast 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("유효하지 않은 길이: {len} (최소 {min})")]
    InvalidLength { len: usize, min: usize },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("알 수 없는 레코드 타입: {0}")]
    InvalidRecordType(u8),

    #[error("패킷 크기 초과: {len} > {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("채널 에러")]
    ChannelError,

    #[error("세션 종료됨")]
    SessionStopped,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
