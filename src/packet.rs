//! 패킷과 시퀀스 번호 연산
//!
//! - Packet: 애플리케이션 페이로드 + 시퀀스/scope 메타데이터
//! - 시퀀스 번호는 32비트 modulo 산술로 비교한다

use std::time::Instant;

use bytes::Bytes;

use crate::MTU;

/// 신뢰성 데이터 레코드 헤더 크기
pub const RELIABLE_HEADER_LEN: usize = 16;

/// 비신뢰성 데이터 레코드 헤더 크기
pub const UNRELIABLE_HEADER_LEN: usize = 8;

/// 시퀀스 번호 차이 (`a - b`, 32비트 modulo)
///
/// 실제 차이의 절댓값이 2^31 미만일 때만 정확하다.
#[inline]
pub fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// 송수신 패킷
#[derive(Debug, Clone)]
pub struct Packet {
    /// 시퀀스 번호 (신뢰성 패킷만 의미 있음)
    pub seqno: u32,

    /// 신뢰성 전송 여부
    pub reliable: bool,

    /// scope (TTL)
    pub scope: u8,

    /// 재전송 ID (복구 요청자 ID, 중복 복구 억제용)
    pub retransmit_id: u32,

    /// 원래 데이터 소스 ID
    pub source: u32,

    /// 실제 송신자 ID (제3자 복구 시 source와 다름)
    pub sender: u32,

    /// NTP32 송신 타임스탬프
    pub timestamp: u32,

    /// 페이로드
    pub payload: Bytes,

    /// 수신/송신 시각
    pub received_at: Option<Instant>,
}

impl Packet {
    /// 신뢰성 패킷 생성
    pub fn reliable(payload: impl Into<Bytes>) -> Self {
        Self::new(true, payload.into())
    }

    /// 비신뢰성(out-of-band) 패킷 생성
    pub fn unreliable(payload: impl Into<Bytes>) -> Self {
        Self::new(false, payload.into())
    }

    fn new(reliable: bool, payload: Bytes) -> Self {
        Self {
            seqno: 0,
            reliable,
            scope: 0,
            retransmit_id: 0,
            source: 0,
            sender: 0,
            timestamp: 0,
            payload,
            received_at: None,
        }
    }

    /// 페이로드 길이
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 페이로드 데이터
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// 한 데이터그램에 담을 수 있는 최대 페이로드
    pub fn max_payload(reliable: bool) -> usize {
        // 4바이트 정렬 패딩 최소 1바이트 여유
        if reliable {
            MTU - RELIABLE_HEADER_LEN - 4
        } else {
            MTU - UNRELIABLE_HEADER_LEN - 4
        }
    }

    /// 제3자 복구 패킷 여부
    pub fn is_third_party(&self) -> bool {
        self.sender != self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_diff_antisymmetric() {
        let samples = [0u32, 1, 2, 100, 0x7fff_ffff, 0x8000_0000, 0xffff_fffe, u32::MAX];
        for &a in &samples {
            for &b in &samples {
                let d = seq_diff(a, b);
                if d != i32::MIN {
                    assert_eq!(d, -seq_diff(b, a), "a={:#x} b={:#x}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_seq_diff_wraparound() {
        assert_eq!(seq_diff(0xffff_fffe, 2), -4);
        assert_eq!(seq_diff(2, 0xffff_fffe), 4);
        assert_eq!(seq_diff(5, 3), 2);
        assert_eq!(seq_diff(3, 5), -2);
    }

    #[test]
    fn test_packet_constructors() {
        let p = Packet::reliable(vec![1u8, 2, 3]);
        assert!(p.reliable);
        assert_eq!(p.len(), 3);

        let p = Packet::unreliable(&b"oob"[..]);
        assert!(!p.reliable);
        assert_eq!(p.data(), b"oob");
    }
}
