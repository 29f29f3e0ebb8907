//! Records shared with the BPF unwinder.
//!
//! Every struct in here is read by the kernel program as raw bytes, so field
//! order, width and padding must match the C definitions exactly. Padding is
//! spelled out as explicit fields so the records can be handed to the kernel
//! with `plain::as_bytes` without exposing uninitialised bytes.

use std::fmt;
use std::mem::size_of;

use plain::Plain;
use thiserror::Error;

pub type Pid = u32;

/// Smallest stack delta bucket. The inner map of bucket `n` holds `2^n` deltas.
pub const STACK_DELTA_BUCKET_SMALLEST: u16 = 4;
/// Largest stack delta bucket.
pub const STACK_DELTA_BUCKET_LARGEST: u16 = 23;

/// Number of address bits covered by a stack delta page.
pub const STACK_DELTA_PAGE_BITS: u32 = 16;
pub const STACK_DELTA_PAGE_SIZE: u64 = 1 << STACK_DELTA_PAGE_BITS;
pub const STACK_DELTA_PAGE_MASK: u64 = !(STACK_DELTA_PAGE_SIZE - 1);

/// Bits of an LPM key taken by the pid. Always part of the prefix.
pub const BIT_WIDTH_PID: u32 = 32;
/// Bits of an LPM key taken by the page address.
pub const BIT_WIDTH_PAGE: u32 = 64;

/// Upper bits of `bias_and_unwind_program` that hold the unwinder program.
const UNWIND_PROGRAM_SHIFT: u32 = 56;
const BIAS_MASK: u64 = (1 << UNWIND_PROGRAM_SHIFT) - 1;

/// Content derived identifier of an executable.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

impl FileId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Key used for the outer stack delta maps and `interpreter_offsets`.
    pub fn to_key_bytes(&self) -> [u8; 8] {
        self.0.to_ne_bytes()
    }
}

impl From<u64> for FileId {
    fn from(value: u64) -> Self {
        FileId(value)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FileId(0x{:x})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// One unwinding instruction of the global `unwind_info_array`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct UnwindInfo {
    pub opcode: u8,
    pub fp_opcode: u8,
    pub merge_opcode: u8,
    pub _pad: u8,
    pub param: i32,
    pub fp_param: i32,
}

/// Entry of an inner stack delta map: the low address bits within a page and
/// the index of the unwind instruction in `unwind_info_array`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StackDelta {
    pub addr_low: u16,
    pub unwind_info: u16,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StackDeltaPageKey {
    pub file_id: u64,
    pub page: u64,
}

/// Where the deltas of a page live: `num_deltas` entries starting at
/// `first_delta` in the inner map of bucket `map_id`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StackDeltaPageInfo {
    pub first_delta: u32,
    pub num_deltas: u16,
    pub map_id: u16,
}

/// LPM trie key of `pid_page_to_mapping_info`.
///
/// The trie compares keys as big endian bit strings, so `pid` and `page` are
/// stored byte swapped relative to the host order. `prefix_len` counts bits
/// starting at `pid`.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct PidPage {
    pub prefix_len: u32,
    pub pid: u32,
    pub page: u64,
}

impl PidPage {
    /// `page_bits` is the number of significant bits of `page`, the pid is
    /// always fully part of the prefix.
    pub fn new(pid: Pid, page: u64, page_bits: u32) -> Self {
        Self {
            prefix_len: BIT_WIDTH_PID + page_bits,
            pid: pid.to_be(),
            page: page.to_be(),
        }
    }

    /// Host order pid.
    pub fn pid(&self) -> Pid {
        u32::from_be(self.pid)
    }

    /// Host order page address.
    pub fn page(&self) -> u64 {
        u64::from_be(self.page)
    }
}

impl fmt::Debug for PidPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PidPage")
            .field("prefix_len", &self.prefix_len)
            .field("pid", &self.pid())
            .field("page", &format_args!("0x{:x}", self.page()))
            .finish()
    }
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PidPageMappingInfo {
    pub file_id: u64,
    pub bias_and_unwind_program: u64,
}

/// Value of `interpreter_offsets`: the text ranges of an interpreter loop.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct OffsetRange {
    pub lower_offset1: u64,
    pub upper_offset1: u64,
    pub lower_offset2: u64,
    pub upper_offset2: u64,
    pub program_index: u16,
    pub _pad: [u8; 6],
}

unsafe impl Plain for UnwindInfo {}
unsafe impl Plain for StackDelta {}
unsafe impl Plain for StackDeltaPageKey {}
unsafe impl Plain for StackDeltaPageInfo {}
unsafe impl Plain for PidPage {}
unsafe impl Plain for PidPageMappingInfo {}
unsafe impl Plain for OffsetRange {}

const _: () = assert!(size_of::<UnwindInfo>() == 12);
const _: () = assert!(size_of::<StackDelta>() == 4);
const _: () = assert!(size_of::<StackDeltaPageKey>() == 16);
const _: () = assert!(size_of::<StackDeltaPageInfo>() == 8);
const _: () = assert!(size_of::<PidPage>() == 16);
const _: () = assert!(size_of::<PidPageMappingInfo>() == 16);
const _: () = assert!(size_of::<OffsetRange>() == 40);

/// Unwinder programs the BPF side can tail call into. The values index the
/// program array and must stay in sync with the kernel side.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnwindProgram {
    Stop = 0,
    Native = 1,
    HotSpot = 2,
    Perl = 3,
    Python = 4,
    Php = 5,
    Ruby = 6,
    V8 = 7,
    Dotnet = 8,
    GoLabels = 9,
}

impl TryFrom<u8> for UnwindProgram {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => UnwindProgram::Stop,
            1 => UnwindProgram::Native,
            2 => UnwindProgram::HotSpot,
            3 => UnwindProgram::Perl,
            4 => UnwindProgram::Python,
            5 => UnwindProgram::Php,
            6 => UnwindProgram::Ruby,
            7 => UnwindProgram::V8,
            8 => UnwindProgram::Dotnet,
            9 => UnwindProgram::GoLabels,
            other => return Err(other),
        })
    }
}

/// Runtimes with a per process data map on the BPF side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InterpreterType {
    Native,
    Kernel,
    Dotnet,
    Perl,
    Python,
    HotSpot,
    Php,
    Ruby,
    V8,
    ApmInt,
    GoLabels,
}

impl InterpreterType {
    /// Name of the per process map, `None` for types without one.
    pub fn proc_map_name(&self) -> Option<&'static str> {
        match self {
            InterpreterType::Dotnet => Some("dotnet_procs"),
            InterpreterType::Perl => Some("perl_procs"),
            InterpreterType::Python => Some("py_procs"),
            InterpreterType::HotSpot => Some("hotspot_procs"),
            InterpreterType::Php => Some("php_procs"),
            InterpreterType::Ruby => Some("ruby_procs"),
            InterpreterType::V8 => Some("v8_procs"),
            InterpreterType::ApmInt => Some("apm_int_procs"),
            InterpreterType::GoLabels => Some("go_labels_procs"),
            InterpreterType::Native | InterpreterType::Kernel => None,
        }
    }

    pub const WITH_PROC_DATA: [InterpreterType; 9] = [
        InterpreterType::Dotnet,
        InterpreterType::Perl,
        InterpreterType::Python,
        InterpreterType::HotSpot,
        InterpreterType::Php,
        InterpreterType::Ruby,
        InterpreterType::V8,
        InterpreterType::ApmInt,
        InterpreterType::GoLabels,
    ];
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bias 0x{0:x} does not fit in 56 bits")]
pub struct BiasOutOfRange(pub u64);

/// Packs a load bias and an unwinder program into one word. The program
/// takes the top 8 bits, the bias must fit in the remaining 56.
pub fn encode_bias_and_unwind_program(
    bias: u64,
    program: UnwindProgram,
) -> Result<u64, BiasOutOfRange> {
    if bias & !BIAS_MASK != 0 {
        return Err(BiasOutOfRange(bias));
    }
    Ok(bias | ((program as u64) << UNWIND_PROGRAM_SHIFT))
}

/// Inverse of [`encode_bias_and_unwind_program`]. Returns the raw program
/// byte since the kernel side may know programs this side does not.
pub fn decode_bias_and_unwind_program(encoded: u64) -> (u64, u8) {
    (encoded & BIAS_MASK, (encoded >> UNWIND_PROGRAM_SHIFT) as u8)
}
