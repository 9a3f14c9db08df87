//! 소스별 패킷 캐시 (링 버퍼)
//!
//! 슬롯은 `seqno & (size - 1)`. 슬롯에 저장된 패킷의 시퀀스 번호가 정확히 일치할 때만
//! 점유된 것으로 본다.

use crate::packet::Packet;

#[derive(Debug)]
pub struct PacketCache {
    slots: Vec<Option<Packet>>,
    mask: u32,
}

impl PacketCache {
    /// 캐시 생성 (크기는 2의 거듭제곱으로 올림)
    pub fn new(size: usize) -> Self {
        let capacity = size.max(1).next_power_of_two();
        Self {
            slots: vec![None; capacity],
            mask: (capacity - 1) as u32,
        }
    }

    /// 최대 보관 패킷 수
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, seqno: u32) -> usize {
        (seqno & self.mask) as usize
    }

    pub fn add(&mut self, packet: Packet) {
        let i = self.slot(packet.seqno);
        self.slots[i] = Some(packet);
    }

    pub fn get(&self, seqno: u32) -> Option<&Packet> {
        self.slots[self.slot(seqno)]
            .as_ref()
            .filter(|p| p.seqno == seqno)
    }

    pub fn contains(&self, seqno: u32) -> bool {
        self.get(seqno).is_some()
    }

    pub fn remove(&mut self, packet: &Packet) -> Option<Packet> {
        self.remove_by_seqno(packet.seqno)
    }

    pub fn remove_by_seqno(&mut self, seqno: u32) -> Option<Packet> {
        let i = self.slot(seqno);
        match &self.slots[i] {
            Some(p) if p.seqno == seqno => self.slots[i].take(),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}
