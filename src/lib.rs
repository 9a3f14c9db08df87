//! # SMCast (Scoped Multicast)
//!
//! UDP 멀티캐스트 위의 NACK 기반 신뢰성 전송 프로토콜
//!
//! ## 핵심 특징
//! - **NACK 기반**: 수신자가 누락 시퀀스만 low + 32비트 비트마스크로 요청
//! - **지역 복구**: TTL 경계로 나뉜 복구 도메인 체인, 손실 근처에서 먼저 복구
//! - **제3자 복구**: 캐시를 가진 수신자가 NACK-Reply 후 대신 재전송
//! - **중복 억제**: 엿들은 NACK/복구로 같은 요청과 같은 재전송을 생략
//! - **전송률 제어**: NACK 깊이 기반 감소, 주기적 증가, pacing
//! - **보고**: Sender Report, 확률적 RR-Selection, Receiver Report로 RTT/손실 측정

pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod domain;
pub mod entity;
pub mod error;
pub mod flow;
pub mod loss;
pub mod packet;
pub mod recovery;
pub mod session;
pub mod stats;
pub mod timer;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ReceiverReportPolicy, Reliability, Throughput};
pub use dispatcher::{Dispatcher, EventReceiver, SessionEvent};
pub use error::{Error, Result};
pub use loss::ErrorCause;
pub use packet::Packet;
pub use session::Session;
pub use stats::{DomainStats, SessionStats};
pub use transport::{Transport, UdpTransport};

/// 프로토콜 버전 (헤더 상위 2비트)
pub const PROTOCOL_VERSION: u8 = 1;

/// 데이터그램 최대 크기 (바이트)
pub const MTU: usize = 1400;
