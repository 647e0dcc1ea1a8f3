//! The flash writer routine run on the target core.
//!
//! The routine drains flash words from a circular buffer in RAM into the flash
//! page assembly buffer, committing each full page, until it has written the
//! requested number of flash words or the host cancels it.
//!
//! Registers on entry: r0 work area, r1 work area end, r2 destination address,
//! r3 number of flash words, sp work area + 100.
//!
//! Work area layout:
//!
//! ```text
//! +0    stack (100 bytes)
//! +100  write pointer, owned by the host; 0 cancels the routine
//! +104  read pointer, owned by the routine; 0 reports an abort
//! +108  buffer data, up to the work area end
//! ```
//!
//! [`WriterRoutine`] is a model of the same loop, stepped by the simulator.

use crate::target::AlgorithmParams;
use super::command::{ADDR_5554, ADDR_AAA8, ADDR_55F0, ADDR_55F4};
use super::status::FSR;
use super::writer::{Fifo, Consumer};

pub const STACK_SIZE: u32 = 100;
pub const WP_OFFSET: u32 = 100;
pub const RP_OFFSET: u32 = 104;
/// Size of the work area ahead of the buffer data.
pub const HEADER_SIZE: u32 = 108;

/// Bytes per flash word, the unit the routine consumes.
pub const FLASH_WORD_SIZE: u32 = 8;
/// Bytes committed by one write-page command.
pub const PAGE_SIZE: u32 = 256;
/// 32-bit words per page, as counted by the routine.
pub const PAGE_WORDS: u32 = PAGE_SIZE / 4;

/// Thumb-1 machine code of the writer routine.
///
/// ```text
///  00  6e84  ldr   r4, [r0, #104]    ; r4 = rp
///  02  46a0  mov   r8, r4            ; r8 = buffer start
///  04  2600  movs  r6, #0            ; r6 = words in page
///  06  2b00  loop: cmp r3, #0
///  08  d02f  beq   done
///  0a  6e47  ldr   r7, [r0, #100]    ; r7 = wp
///  0c  2f00  cmp   r7, #0
///  0e  d02c  beq   done
///  10  1b3f  subs  r7, r7, r4
///  12  d500  bpl   check
///  14  1b0f  subs  r7, r1, r4
///  16  2f08  check: cmp r7, #8
///  18  dbf5  blt   loop
///  1a  2e00  cmp   r6, #0
///  1c  d104  bne   load
///  1e  4d13  ldr   r5, =0x0c005554
///  20  27f5  movs  r7, #0xf5         ; clear status
///  22  602f  str   r7, [r5]
///  24  2750  movs  r7, #0x50         ; enter page mode
///  26  602f  str   r7, [r5]
///  28  4d11  load: ldr r5, =0x0c0055f0
///  2a  6827  ldr   r7, [r4]
///  2c  602f  str   r7, [r5]
///  2e  6867  ldr   r7, [r4, #4]
///  30  606f  str   r7, [r5, #4]
///  32  3602  adds  r6, #2
///  34  2e40  cmp   r6, #64
///  36  d111  bne   advance
///  38  4d0c  ldr   r5, =0x0c005554   ; write page
///  3a  27aa  movs  r7, #0xaa
///  3c  602f  str   r7, [r5]
///  3e  4d0d  ldr   r5, =0x0c00aaa8
///  40  2755  movs  r7, #0x55
///  42  602f  str   r7, [r5]
///  44  4d09  ldr   r5, =0x0c005554
///  46  27a0  movs  r7, #0xa0
///  48  602f  str   r7, [r5]
///  4a  27aa  movs  r7, #0xaa
///  4c  6017  str   r7, [r2]
///  4e  4d0a  ldr   r5, =0x58002010
///  50  682f  busy: ldr r7, [r5]
///  52  07ff  lsls  r7, r7, #31       ; PBUSY
///  54  d1fc  bne   busy
///  56  00b7  lsls  r7, r6, #2
///  58  19d2  adds  r2, r2, r7
///  5a  2600  movs  r6, #0
///  5c  3408  advance: adds r4, #8
///  5e  428c  cmp   r4, r1
///  60  d300  bcc   nowrap
///  62  4644  mov   r4, r8
///  64  6684  nowrap: str r4, [r0, #104]
///  66  3b01  subs  r3, #1
///  68  e7cd  b     loop
///  6a  be00  done: bkpt #0
///  6c        .word 0x0c005554, 0x0c0055f0, 0x0c00aaa8, 0x58002010
/// ```
pub const WRITER_CODE: [u8; 124] = [
    0x84, 0x6e, 0xa0, 0x46, 0x00, 0x26, 0x00, 0x2b, 0x2f, 0xd0, 0x47, 0x6e,
    0x00, 0x2f, 0x2c, 0xd0, 0x3f, 0x1b, 0x00, 0xd5, 0x0f, 0x1b, 0x08, 0x2f,
    0xf5, 0xdb, 0x00, 0x2e, 0x04, 0xd1, 0x13, 0x4d, 0xf5, 0x27, 0x2f, 0x60,
    0x50, 0x27, 0x2f, 0x60, 0x11, 0x4d, 0x27, 0x68, 0x2f, 0x60, 0x67, 0x68,
    0x6f, 0x60, 0x02, 0x36, 0x40, 0x2e, 0x11, 0xd1, 0x0c, 0x4d, 0xaa, 0x27,
    0x2f, 0x60, 0x0d, 0x4d, 0x55, 0x27, 0x2f, 0x60, 0x09, 0x4d, 0xa0, 0x27,
    0x2f, 0x60, 0xaa, 0x27, 0x17, 0x60, 0x0a, 0x4d, 0x2f, 0x68, 0xff, 0x07,
    0xfc, 0xd1, 0xb7, 0x00, 0xd2, 0x19, 0x00, 0x26, 0x08, 0x34, 0x8c, 0x42,
    0x00, 0xd3, 0x44, 0x46, 0x84, 0x66, 0x01, 0x3b, 0xcd, 0xe7, 0x00, 0xbe,
    0x54, 0x55, 0x00, 0x0c, 0xf0, 0x55, 0x00, 0x0c, 0xa8, 0xaa, 0x00, 0x0c,
    0x10, 0x20, 0x00, 0x58,
];

/// Word-level access to target memory and peripherals, as seen by the core.
pub trait TargetBus {
    fn load(&mut self, address: u32) -> u32;
    fn store(&mut self, address: u32, value: u32);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Running,
    /// A page write is in progress; poll FSR before continuing.
    Busy,
    Halted,
}

/// Result of one [`WriterRoutine::step`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Consumed one flash word.
    Wrote,
    /// Waiting on the host or on the flash controller.
    Waiting,
    /// Reached `bkpt`.
    Halted,
}

/// Model of the writer routine, one flash word per step.
#[derive(Debug)]
pub struct WriterRoutine {
    consumer: Consumer,
    dest: u32,
    count: u32,
    page_words: u32,
    state: State,
}

impl WriterRoutine {
    /// Start the routine with the registers a host would load.
    pub fn start<B: TargetBus>(bus: &mut B, params: &AlgorithmParams) -> Self {
        let [work_area, end, dest, count] = params.args;
        let fifo = Fifo::from_bounds(work_area, end);
        WriterRoutine {
            consumer: fifo.consumer(bus),
            dest,
            count,
            page_words: 0,
            state: State::Running,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state == State::Halted
    }

    /// Stop as if the core had been halted by the debugger.
    pub fn halt(&mut self) {
        self.state = State::Halted;
    }

    /// Report a failure to the host by clearing the read pointer, then stop.
    pub fn abort<B: TargetBus>(&mut self, bus: &mut B) {
        self.consumer.abort(bus);
        self.state = State::Halted;
    }

    /// Flash words still to be written.
    pub fn remaining(&self) -> u32 {
        self.count
    }

    pub fn step<B: TargetBus>(&mut self, bus: &mut B) -> Step {
        match self.state {
            State::Halted => Step::Halted,
            State::Busy => {
                if bus.load(FSR) & 1 != 0 {
                    return Step::Waiting;
                }
                self.dest += self.page_words * 4;
                self.page_words = 0;
                self.advance(bus);
                Step::Wrote
            },
            State::Running => {
                if self.count == 0 {
                    self.state = State::Halted;
                    return Step::Halted;
                }
                let available = match self.consumer.available(bus) {
                    Some(n) => n,
                    None => {
                        self.state = State::Halted;
                        return Step::Halted;
                    },
                };
                if available < FLASH_WORD_SIZE {
                    return Step::Waiting;
                }

                if self.page_words == 0 {
                    bus.store(ADDR_5554, 0xF5);
                    bus.store(ADDR_5554, 0x50);
                }
                let rp = self.consumer.position();
                let low = bus.load(rp);
                let high = bus.load(rp + 4);
                bus.store(ADDR_55F0, low);
                bus.store(ADDR_55F4, high);
                self.page_words += 2;

                if self.page_words == PAGE_WORDS {
                    bus.store(ADDR_5554, 0xAA);
                    bus.store(ADDR_AAA8, 0x55);
                    bus.store(ADDR_5554, 0xA0);
                    bus.store(self.dest, 0xAA);
                    self.state = State::Busy;
                    return Step::Waiting;
                }
                self.advance(bus);
                Step::Wrote
            },
        }
    }

    fn advance<B: TargetBus>(&mut self, bus: &mut B) {
        self.consumer.advance(bus, FLASH_WORD_SIZE);
        self.count -= 1;
        self.state = State::Running;
    }
}
