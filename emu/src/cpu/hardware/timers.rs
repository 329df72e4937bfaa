use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

const PRESCALER_CYCLES: [u32; 4] = [1, 64, 256, 1024];

/// One of the four 16-bit timer channels.
///
/// TMxCNT_L is two registers behind one address: reads return the live
/// counter, writes set the reload value applied at the next overflow (or
/// when the timer is switched on).
#[derive(Default, Serialize, Deserialize)]
pub struct Timer {
    /// Live 16-bit counter.
    pub counter: u16,
    /// Reload value (TMxCNT_L writes land here).
    pub reload: u16,
    /// TMxCNT_H raw register.
    pub control: u16,
    /// Cycles accumulated towards the next prescaled increment.
    ticks: u32,
}

impl Timer {
    pub fn prescaler(&self) -> u32 {
        PRESCALER_CYCLES[self.control.get_bits(0..=1) as usize]
    }

    pub fn count_up(&self) -> bool {
        self.control.get_bit(2)
    }

    pub fn irq_enabled(&self) -> bool {
        self.control.get_bit(6)
    }

    pub fn enabled(&self) -> bool {
        self.control.get_bit(7)
    }

    /// Handles a TMxCNT_H write; a rising enable edge loads the counter
    /// from the reload register and restarts the prescaler.
    pub fn write_control(&mut self, value: u16) {
        let was_enabled = self.enabled();
        self.control = value;
        if !was_enabled && self.enabled() {
            self.counter = self.reload;
            self.ticks = 0;
        }
    }

    /// Single prescaled increment. Returns true on 0xFFFF wrap, which
    /// reloads the counter.
    fn increment(&mut self) -> bool {
        if self.counter == 0xFFFF {
            self.counter = self.reload;
            true
        } else {
            self.counter += 1;
            false
        }
    }
}

/// What a batch of timer work produced: IRQ lines to raise and how many
/// times timers 0/1 overflowed (the audio FIFO clock).
#[derive(Default)]
pub struct TimersStepOutput {
    pub request_irq: [bool; 4],
    pub fifo_ticks: [u32; 2],
}

#[derive(Default, Serialize, Deserialize)]
pub struct Timers {
    pub timers: [Timer; 4],
}

impl Timers {
    /// Advances all enabled channels by `cycles` CPU cycles.
    ///
    /// Channels run in ascending order so a count-up channel sees the
    /// overflows its predecessor produced in this same batch.
    pub fn run(&mut self, cycles: u32) -> TimersStepOutput {
        let mut output = TimersStepOutput::default();
        let mut previous_overflows = 0u32;

        for (i, timer) in self.timers.iter_mut().enumerate() {
            if !timer.enabled() {
                previous_overflows = 0;
                continue;
            }

            let mut overflows = 0u32;

            if i > 0 && timer.count_up() {
                // Cascade: one increment per overflow of the previous
                // channel, the prescaler is ignored.
                for _ in 0..previous_overflows {
                    if timer.increment() {
                        overflows += 1;
                    }
                }
            } else {
                timer.ticks += cycles;
                let prescaler = timer.prescaler();
                while timer.ticks >= prescaler {
                    timer.ticks -= prescaler;
                    if timer.increment() {
                        overflows += 1;
                    }
                }
            }

            if overflows > 0 {
                if timer.irq_enabled() {
                    output.request_irq[i] = true;
                }
                if i < 2 {
                    output.fifo_ticks[i] += overflows;
                }
            }

            previous_overflows = overflows;
        }

        output
    }
}
