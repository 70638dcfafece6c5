// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-direction spill buffer for short writes

/// A growable, contiguous byte buffer holding bytes that could not be written
/// to the peer socket yet.
///
/// Storage grows geometrically (powers of two) up to `cap`. Once `cap` is
/// reached the buffer reports saturation, which the reactor translates into
/// backpressure: the source side's read interest is cleared until the spill
/// drains and the kernel TCP window throttles the sender.
#[derive(Debug)]
pub struct Spill {
    data: Vec<u8>,
    read_offset: usize,
    initial: usize,
    cap: usize,
}

impl Spill {
    /// Creates an empty spill buffer. Nothing is allocated until the first
    /// short write.
    pub fn new(initial: usize, cap: usize) -> Self {
        let initial = initial.next_power_of_two().min(cap);
        Self {
            data: Vec::new(),
            read_offset: 0,
            initial,
            cap: cap.max(initial),
        }
    }

    /// Bytes pending delivery to the peer.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_offset
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// True once the buffer has reached its growth cap. Further `push` calls
    /// still succeed (the pending read already happened; dropping bytes would
    /// corrupt the stream) but the caller must stop reading from the source.
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.remaining() >= self.cap
    }

    /// View of the pending bytes, oldest first.
    #[inline]
    pub fn pending(&self) -> &[u8] {
        &self.data[self.read_offset..]
    }

    /// Appends bytes the peer socket refused to take.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.data.capacity() == 0 {
            self.data.reserve_exact(self.initial.max(bytes.len().next_power_of_two()));
        } else if self.data.len() + bytes.len() > self.data.capacity() {
            self.compact();
            let needed = self.data.len() + bytes.len();
            if needed > self.data.capacity() {
                // Doubling keeps growth geometric; reserve_exact avoids Vec's
                // own amortization policy overshooting the cap.
                let target = needed.next_power_of_two();
                self.data.reserve_exact(target - self.data.len());
            }
        }
        self.data.extend_from_slice(bytes);
    }

    /// Marks `amount` pending bytes as delivered.
    pub fn consume(&mut self, amount: usize) {
        self.read_offset = self.data.len().min(self.read_offset + amount);
        if self.read_offset == self.data.len() {
            self.clear();
        }
    }

    /// Resets to a clean state, releasing storage beyond the initial size.
    fn clear(&mut self) {
        self.data.clear();
        self.read_offset = 0;
        if self.data.capacity() > self.initial {
            self.data.shrink_to(self.initial);
        }
    }

    /// Moves pending bytes to the front so freed space can be reused without
    /// an allocation.
    fn compact(&mut self) {
        if self.read_offset == 0 {
            return;
        }
        let len = self.remaining();
        self.data.copy_within(self.read_offset.., 0);
        self.data.truncate(len);
        self.read_offset = 0;
    }
}

#[cfg(test)]
mod test {
    use super::Spill;

    #[test]
    fn starts_empty_and_unallocated() {
        let s = Spill::new(4096, 65536);
        assert!(s.is_empty());
        assert!(!s.is_saturated());
        assert_eq!(0, s.remaining());
    }

    #[test]
    fn push_then_consume_round_trips() {
        let mut s = Spill::new(16, 65536);
        s.push(b"hello ");
        s.push(b"world");
        assert_eq!(b"hello world", s.pending());
        s.consume(6);
        assert_eq!(b"world", s.pending());
        s.consume(5);
        assert!(s.is_empty());
    }

    #[test]
    fn consume_past_end_is_clamped() {
        let mut s = Spill::new(16, 64);
        s.push(b"abc");
        s.consume(1000);
        assert!(s.is_empty());
    }

    #[test]
    fn saturates_at_cap() {
        let mut s = Spill::new(16, 32);
        s.push(&[0u8; 31]);
        assert!(!s.is_saturated());
        s.push(&[0u8; 1]);
        assert!(s.is_saturated());
        s.consume(16);
        assert!(!s.is_saturated());
    }

    #[test]
    fn compaction_preserves_order() {
        let mut s = Spill::new(8, 1024);
        s.push(b"0123456789");
        s.consume(4);
        s.push(b"abcdef");
        assert_eq!(b"456789abcdef", s.pending());
    }
}
