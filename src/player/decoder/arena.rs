// 音频环形缓冲区：所有排队帧共享的一块字节区

/// 指向环形缓冲区的一个窗口
///
/// 重新分配会增加代数，旧句柄随之失效
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSlot {
    pub offset: usize,
    pub len: usize,
    pub generation: u64,
}

#[derive(Debug)]
pub struct SampleArena {
    data: Vec<u8>,
    cursor: usize,
    generation: u64,
    slot_bytes: usize,
    slots: usize,
}

impl SampleArena {
    /// `slot_bytes` 为单帧最大字节数，`slots` 为可容纳的最大帧数
    pub fn new(slot_bytes: usize, slots: usize) -> Self {
        let slot_bytes = slot_bytes.max(1);
        let slots = slots.max(1);
        Self {
            data: vec![0; slot_bytes * slots],
            cursor: 0,
            generation: 0,
            slot_bytes,
            slots,
        }
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor.min(self.data.len());
    }

    /// 在写游标处分配窗口，越过末尾时回绕到起点
    pub fn alloc(&mut self, len: usize) -> ArenaSlot {
        let len = len.min(self.slot_bytes);
        if self.cursor + len > self.data.len() {
            self.cursor = 0;
        }
        let slot = ArenaSlot {
            offset: self.cursor,
            len,
            generation: self.generation,
        };
        self.cursor += len;
        slot
    }

    /// 以新的单帧容量重建，所有旧句柄失效
    pub fn reallocate(&mut self, slot_bytes: usize) {
        self.slot_bytes = slot_bytes.max(1);
        self.data = vec![0; self.slot_bytes * self.slots];
        self.cursor = 0;
        self.generation += 1;
    }

    fn is_live(&self, slot: &ArenaSlot) -> bool {
        slot.generation == self.generation && slot.offset + slot.len <= self.data.len()
    }

    pub fn slice(&self, slot: &ArenaSlot) -> Option<&[u8]> {
        self.is_live(slot)
            .then(|| &self.data[slot.offset..slot.offset + slot.len])
    }

    pub fn slice_mut(&mut self, slot: &ArenaSlot) -> Option<&mut [u8]> {
        if !self.is_live(slot) {
            return None;
        }
        Some(&mut self.data[slot.offset..slot.offset + slot.len])
    }

    /// 静音填充（f32 与 i16 的零值即静音）
    pub fn fill_silence(&mut self, slot: &ArenaSlot) {
        if let Some(window) = self.slice_mut(slot) {
            window.fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_wraps_at_end() {
        let mut arena = SampleArena::new(16, 3);
        let a = arena.alloc(16);
        let b = arena.alloc(16);
        let c = arena.alloc(12);
        assert_eq!((a.offset, b.offset, c.offset), (0, 16, 32));
        // 44 + 8 > 48，回绕
        let d = arena.alloc(8);
        assert_eq!(d.offset, 0);
    }

    #[test]
    fn test_reallocate_invalidates_slots() {
        let mut arena = SampleArena::new(8, 4);
        let slot = arena.alloc(8);
        arena.slice_mut(&slot).unwrap().copy_from_slice(&[1; 8]);
        assert_eq!(arena.slice(&slot).unwrap(), &[1; 8]);

        arena.reallocate(32);
        assert_eq!(arena.generation(), 1);
        assert_eq!(arena.capacity(), 128);
        assert!(arena.slice(&slot).is_none());
    }

    #[test]
    fn test_fill_silence() {
        let mut arena = SampleArena::new(4, 2);
        let slot = arena.alloc(4);
        arena.slice_mut(&slot).unwrap().copy_from_slice(&[9, 9, 9, 9]);
        arena.fill_silence(&slot);
        assert_eq!(arena.slice(&slot).unwrap(), &[0, 0, 0, 0]);
    }
}
