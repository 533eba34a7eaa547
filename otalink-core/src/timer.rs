// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Cooperative timer pool driven by a fixed polling tick.
//!
//! Slots live in a fixed arena and are addressed by stable handles. The tick
//! entry point is safe to call from an interrupt: it only decrements counters
//! and sets expiry flags. Expired slots are consumed cooperatively by the
//! polling loop through [`TimerPool::take_expired`].

/// Stable handle into the timer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub struct TimerHandle(usize);

#[derive(Clone, Copy)]
struct Slot {
    live: bool,
    armed: bool,
    remaining: u32,
    /// Re-arm interval in ticks; 0 for one-shot.
    period: u32,
    expired: bool,
}

impl Slot {
    const IDLE: Slot = Slot {
        live: false,
        armed: false,
        remaining: 0,
        period: 0,
        expired: false,
    };
}

pub struct TimerPool<const N: usize> {
    slots: [Slot; N],
}

impl<const N: usize> TimerPool<N> {
    pub const fn new() -> Self {
        Self {
            slots: [Slot::IDLE; N],
        }
    }

    /// Claim a free slot. Returns `None` when the arena is full.
    pub fn alloc(&mut self) -> Option<TimerHandle> {
        let index = self.slots.iter().position(|s| !s.live)?;
        self.slots[index] = Slot {
            live: true,
            ..Slot::IDLE
        };
        Some(TimerHandle(index))
    }

    pub fn free(&mut self, handle: TimerHandle) {
        self.slots[handle.0] = Slot::IDLE;
    }

    pub fn arm_oneshot(&mut self, handle: TimerHandle, ticks: u32) {
        let slot = &mut self.slots[handle.0];
        slot.armed = true;
        slot.remaining = ticks.max(1);
        slot.period = 0;
        slot.expired = false;
    }

    pub fn arm_periodic(&mut self, handle: TimerHandle, ticks: u32) {
        let slot = &mut self.slots[handle.0];
        slot.armed = true;
        slot.remaining = ticks.max(1);
        slot.period = ticks.max(1);
        slot.expired = false;
    }

    pub fn disarm(&mut self, handle: TimerHandle) {
        let slot = &mut self.slots[handle.0];
        slot.armed = false;
        slot.expired = false;
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.slots[handle.0].armed
    }

    /// Advance every live armed slot by one tick. Interrupt-safe: no work
    /// beyond counter updates and flag sets happens here.
    pub fn tick(&mut self) {
        for slot in self.slots.iter_mut() {
            if !slot.live || !slot.armed {
                continue;
            }
            slot.remaining -= 1;
            if slot.remaining == 0 {
                slot.expired = true;
                if slot.period > 0 {
                    slot.remaining = slot.period;
                } else {
                    slot.armed = false;
                }
            }
        }
    }

    /// Consume the expiry flag of a slot. Returns true at most once per
    /// expiry.
    pub fn take_expired(&mut self, handle: TimerHandle) -> bool {
        let slot = &mut self.slots[handle.0];
        let fired = slot.expired;
        slot.expired = false;
        fired
    }
}

impl<const N: usize> Default for TimerPool<N> {
    fn default() -> Self {
        Self::new()
    }
}
