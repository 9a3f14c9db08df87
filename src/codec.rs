//! 와이어 포맷 인코딩/디코딩
//!
//! 모든 정수는 빅엔디안. 하나의 데이터그램에 여러 레코드를 다중화할 수 있다.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=1|P|  Type   |     Scope     |        Record Length          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Entity ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Type-specific fields ...                   |
//! ```
//!
//! P 비트가 설정되면 레코드의 마지막 바이트가 패딩 길이다.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, PROTOCOL_VERSION};

/// 신뢰성 데이터
pub const DATA: u8 = 0;
/// 복구(재전송) 데이터
pub const REPAIR: u8 = 4;
/// 비신뢰성 데이터
pub const UNRELIABLE: u8 = 8;
/// FEC 데이터 (예약)
pub const FEC: u8 = 12;
pub const NACK: u8 = 17;
pub const NACK_REPLY: u8 = 18;
pub const SENDER_REPORT: u8 = 19;
pub const RR_SELECTION: u8 = 20;
pub const RECEIVER_REPORT: u8 = 21;

/// 공통 레코드 헤더 크기
pub const HEADER_LEN: usize = 8;

/// 최소 레코드 (및 데이터그램) 길이
pub const MIN_RECORD_LEN: usize = 12;

/// 패딩 비트
pub const PAD_BIT: u8 = 0x20;

/// RR-Selection 대상: 전체 수신자
pub const BROADCAST: u32 = 0xffff_ffff;

const TYPE_MASK: u8 = 0x1f;
const NACK_ENTRY_LEN: usize = 12;
const NACK_REPLY_ENTRY_LEN: usize = 24;
const RR_ENTRY_LEN: usize = 20;

/// 레코드 공통 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: u8,
    pub padded: bool,
    pub scope: u8,
    pub length: u16,
    pub entity: u32,
}

impl RecordHeader {
    /// 레코드 앞부분에서 헤더 파싱
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::InvalidLength {
                len: buf.len(),
                min: HEADER_LEN,
            });
        }

        let version = buf[0] >> 6;
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let mut b = &buf[..HEADER_LEN];
        let first = b.get_u8();
        let scope = b.get_u8();
        let length = b.get_u16();
        let entity = b.get_u32();

        Ok(Self {
            record_type: first & TYPE_MASK,
            padded: first & PAD_BIT != 0,
            scope,
            length,
            entity,
        })
    }

    /// 제어 레코드 여부 (타입 16 이상)
    pub fn is_control(&self) -> bool {
        self.record_type >= 16
    }
}

/// NACK 항목: 한 소스에 대한 누락 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackEntry {
    pub source: u32,
    pub low: u32,
    pub bitmask: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    /// 보고자의 NTP32 송신 시각 (NACK-Reply에서 에코)
    pub timestamp: u32,
    pub entries: Vec<NackEntry>,
}

/// NACK-Reply 항목: 제3자 응답자의 복구 예고
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackReplyEntry {
    /// 원래 NACK 보고자
    pub to: u32,
    /// 에코된 NACK 타임스탬프
    pub timestamp: u32,
    /// NACK 수신 후 경과 시간 (Q16.16)
    pub delay: u32,
    pub source: u32,
    pub low: u32,
    pub bitmask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub timestamp: u32,
    /// 다음에 보낼 시퀀스 번호
    pub seqno: u32,
    pub packets: u32,
    pub bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrSelection {
    pub timestamp: u32,
    /// 응답 확률 (0xffff = 1.0, 0 = 주기적 보고)
    pub probability: u16,
    /// 보고 주기 (초)
    pub period_secs: u16,
    pub targets: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReportEntry {
    pub target: u32,
    /// 에코된 RR-Selection 타임스탬프
    pub timestamp: u32,
    /// 선택 후 경과 시간 (Q16.16)
    pub delay: u32,
    pub expected: u32,
    /// 상대 손실률 (1/256 단위)
    pub loss_rate: u8,
    /// 누적 손실 (24비트)
    pub abs_lost: u32,
}

/// 디코딩된 레코드 본문
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Data {
        timestamp: u32,
        seqno: u32,
        payload: Bytes,
    },
    Repair {
        /// 원래 데이터 소스
        source: u32,
        seqno: u32,
        payload: Bytes,
    },
    Unreliable {
        payload: Bytes,
    },
    Fec {
        payload: Bytes,
    },
    Nack(Nack),
    NackReply(Vec<NackReplyEntry>),
    SenderReport(SenderReport),
    RrSelection(RrSelection),
    ReceiverReport(Vec<ReceiverReportEntry>),
}

impl Record {
    pub fn record_type(&self) -> u8 {
        match self {
            Record::Data { .. } => DATA,
            Record::Repair { .. } => REPAIR,
            Record::Unreliable { .. } => UNRELIABLE,
            Record::Fec { .. } => FEC,
            Record::Nack(_) => NACK,
            Record::NackReply(_) => NACK_REPLY,
            Record::SenderReport(_) => SENDER_REPORT,
            Record::RrSelection(_) => RR_SELECTION,
            Record::ReceiverReport(_) => RECEIVER_REPORT,
        }
    }

    fn put_body(&self, buf: &mut BytesMut) {
        match self {
            Record::Data {
                timestamp,
                seqno,
                payload,
            } => {
                buf.put_u32(*timestamp);
                buf.put_u32(*seqno);
                buf.put_slice(payload);
            }
            Record::Repair {
                source,
                seqno,
                payload,
            } => {
                buf.put_u32(*source);
                buf.put_u32(*seqno);
                buf.put_slice(payload);
            }
            Record::Unreliable { payload } | Record::Fec { payload } => {
                buf.put_slice(payload);
            }
            Record::Nack(nack) => {
                buf.put_u32(nack.timestamp);
                for e in &nack.entries {
                    buf.put_u32(e.source);
                    buf.put_u32(e.low);
                    buf.put_u32(e.bitmask);
                }
            }
            Record::NackReply(entries) => {
                for e in entries {
                    buf.put_u32(e.to);
                    buf.put_u32(e.timestamp);
                    buf.put_u32(e.delay);
                    buf.put_u32(e.source);
                    buf.put_u32(e.low);
                    buf.put_u32(e.bitmask);
                }
            }
            Record::SenderReport(sr) => {
                buf.put_u32(sr.timestamp);
                buf.put_u32(sr.seqno);
                buf.put_u32(sr.packets);
                buf.put_u32(sr.bytes);
            }
            Record::RrSelection(rs) => {
                buf.put_u32(rs.timestamp);
                buf.put_u16(rs.probability);
                buf.put_u16(rs.period_secs);
                for t in &rs.targets {
                    buf.put_u32(*t);
                }
            }
            Record::ReceiverReport(entries) => {
                for e in entries {
                    buf.put_u32(e.target);
                    buf.put_u32(e.timestamp);
                    buf.put_u32(e.delay);
                    buf.put_u32(e.expected);
                    buf.put_u8(e.loss_rate);
                    let lost = e.abs_lost.min(0x00ff_ffff);
                    buf.put_u8((lost >> 16) as u8);
                    buf.put_u16(lost as u16);
                }
            }
        }
    }
}

/// 레코드 하나를 버퍼 끝에 추가
///
/// 레코드 길이는 4바이트 배수(최소 12바이트)로 패딩된다. 추가된 바이트 수를 반환.
pub fn encode_record(buf: &mut BytesMut, scope: u8, entity: u32, record: &Record) -> usize {
    let start = buf.len();

    buf.put_u8((PROTOCOL_VERSION << 6) | record.record_type());
    buf.put_u8(scope);
    buf.put_u16(0);
    buf.put_u32(entity);
    record.put_body(buf);

    let mut len = buf.len() - start;
    let mut pad = (4 - len % 4) % 4;
    if len + pad < MIN_RECORD_LEN {
        pad = MIN_RECORD_LEN - len;
    }
    if pad > 0 {
        buf.put_bytes(0, pad - 1);
        buf.put_u8(pad as u8);
        buf[start] |= PAD_BIT;
        len += pad;
    }

    buf[start + 2..start + 4].copy_from_slice(&(len as u16).to_be_bytes());
    len
}

/// 단일 레코드 데이터그램 생성
pub fn encode(scope: u8, entity: u32, record: &Record) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    encode_record(&mut buf, scope, entity, record);
    buf.freeze()
}

/// 디코딩된 레코드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: RecordHeader,
    pub record: Record,
}

/// 레코드 하나 디코딩 (`raw`는 헤더 포함 정확히 한 레코드)
pub fn decode_record(raw: Bytes) -> Result<Frame> {
    let header = RecordHeader::decode(&raw)?;
    let len = header.length as usize;
    if len < MIN_RECORD_LEN || len > raw.len() {
        return Err(Error::InvalidLength {
            len,
            min: MIN_RECORD_LEN,
        });
    }

    let mut end = len;
    if header.padded {
        let pad = raw[len - 1] as usize;
        if pad == 0 || pad > len - HEADER_LEN {
            return Err(Error::InvalidLength {
                len,
                min: HEADER_LEN + pad,
            });
        }
        end -= pad;
    }

    let body = raw.slice(HEADER_LEN..end);
    let record = match header.record_type {
        t if t < REPAIR => {
            let (timestamp, seqno, payload) = split_data(body, len)?;
            Record::Data {
                timestamp,
                seqno,
                payload,
            }
        }
        t if t < UNRELIABLE => {
            let (source, seqno, payload) = split_data(body, len)?;
            Record::Repair {
                source,
                seqno,
                payload,
            }
        }
        t if t < FEC => Record::Unreliable { payload: body },
        t if t < 16 => Record::Fec { payload: body },
        NACK => Record::Nack(decode_nack(body, len)?),
        NACK_REPLY => Record::NackReply(decode_entries(body, len, NACK_REPLY_ENTRY_LEN, |b| {
            NackReplyEntry {
                to: b.get_u32(),
                timestamp: b.get_u32(),
                delay: b.get_u32(),
                source: b.get_u32(),
                low: b.get_u32(),
                bitmask: b.get_u32(),
            }
        })?),
        SENDER_REPORT => {
            let mut b = body;
            if b.remaining() < 16 {
                return Err(Error::InvalidLength {
                    len,
                    min: HEADER_LEN + 16,
                });
            }
            Record::SenderReport(SenderReport {
                timestamp: b.get_u32(),
                seqno: b.get_u32(),
                packets: b.get_u32(),
                bytes: b.get_u32(),
            })
        }
        RR_SELECTION => {
            let mut b = body;
            if b.remaining() < 8 {
                return Err(Error::InvalidLength {
                    len,
                    min: HEADER_LEN + 8,
                });
            }
            let timestamp = b.get_u32();
            let probability = b.get_u16();
            let period_secs = b.get_u16();
            let mut targets = Vec::with_capacity(b.remaining() / 4);
            while b.remaining() >= 4 {
                targets.push(b.get_u32());
            }
            Record::RrSelection(RrSelection {
                timestamp,
                probability,
                period_secs,
                targets,
            })
        }
        RECEIVER_REPORT => Record::ReceiverReport(decode_entries(body, len, RR_ENTRY_LEN, |b| {
            let target = b.get_u32();
            let timestamp = b.get_u32();
            let delay = b.get_u32();
            let expected = b.get_u32();
            let loss_rate = b.get_u8();
            let hi = b.get_u8() as u32;
            let lo = b.get_u16() as u32;
            ReceiverReportEntry {
                target,
                timestamp,
                delay,
                expected,
                loss_rate,
                abs_lost: (hi << 16) | lo,
            }
        })?),
        other => return Err(Error::InvalidRecordType(other)),
    };

    Ok(Frame { header, record })
}

fn split_data(mut body: Bytes, len: usize) -> Result<(u32, u32, Bytes)> {
    if body.remaining() < 8 {
        return Err(Error::InvalidLength {
            len,
            min: HEADER_LEN + 8,
        });
    }
    let word = body.get_u32();
    let seqno = body.get_u32();
    Ok((word, seqno, body))
}

fn decode_nack(mut body: Bytes, len: usize) -> Result<Nack> {
    if body.remaining() < 4 || (body.remaining() - 4) % NACK_ENTRY_LEN != 0 {
        return Err(Error::InvalidLength {
            len,
            min: MIN_RECORD_LEN + NACK_ENTRY_LEN,
        });
    }
    let timestamp = body.get_u32();
    let entries = decode_entries(body, len, NACK_ENTRY_LEN, |b| NackEntry {
        source: b.get_u32(),
        low: b.get_u32(),
        bitmask: b.get_u32(),
    })?;
    Ok(Nack { timestamp, entries })
}

fn decode_entries<T>(
    mut body: Bytes,
    len: usize,
    entry_len: usize,
    mut read: impl FnMut(&mut Bytes) -> T,
) -> Result<Vec<T>> {
    if body.remaining() % entry_len != 0 {
        return Err(Error::InvalidLength {
            len,
            min: HEADER_LEN + entry_len,
        });
    }
    let mut entries = Vec::with_capacity(body.remaining() / entry_len);
    while body.remaining() >= entry_len {
        entries.push(read(&mut body));
    }
    Ok(entries)
}

/// 다중화된 데이터그램의 레코드 순회
///
/// 선언된 길이가 잘못된 레코드를 만나면 에러를 한 번 내고 순회를 멈춘다.
/// 알 수 없는 타입 등 레코드 단위 에러는 해당 레코드만 건너뛴다.
pub struct Frames {
    buf: Bytes,
    offset: usize,
}

impl Frames {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, offset: 0 }
    }
}

impl Iterator for Frames {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.buf.len();
        if self.offset >= total {
            return None;
        }

        let rest = &self.buf[self.offset..];
        let len = if rest.len() >= 4 {
            u16::from_be_bytes([rest[2], rest[3]]) as usize
        } else {
            0
        };

        if len < MIN_RECORD_LEN || self.offset + len > total {
            self.offset = total;
            return Some(Err(Error::InvalidLength {
                len,
                min: MIN_RECORD_LEN,
            }));
        }

        let raw = self.buf.slice(self.offset..self.offset + len);
        self.offset += len;
        Some(decode_record(raw))
    }
}
