//! Fixed numeric constants shared by the whole translator.

/// Size in bytes of every RV32 instruction (the `C` extension is not
/// supported, so this never varies).
pub const INSTRUCTION_SIZE: u32 = 4;

/// Sentinel guest address. No valid guest PC ever takes this value.
pub const INVALID_ADDR: u32 = !0;

/// First address of the synthetic address space handed out to imported
/// external functions. Guest code addresses always stay below this.
pub const FIRST_EXT_FUNC_ADDR: u32 = 0xFFFF_0000;

/// Stride between consecutive synthetic external-function addresses.
pub const EXT_FUNC_STRIDE: u32 = 4;

/// Mask selecting the upper 20 bits of an address (`%hi`).
pub const HI20_MASK: u32 = 0xFFFF_F000;

/// Mask selecting the lower 12 bits of an address (`%lo`).
pub const LO12_MASK: u32 = 0xFFF;

/// Default guest stack size in bytes.
pub const DEFAULT_STACK_SIZE: u32 = 0x10000;

/// Bytes reserved at the top of the guest stack for the argv copy made by
/// `main`'s prologue.
pub const ARGV_AREA: u32 = 256;

/// Upper bound on the number of argument words marshaled to an external
/// function: the icaller argument count minus one (the target word).
pub const MAX_ARGS: usize = 8;

/// Name of the per-module shadow memory global.
pub const SHADOW_MEMORY_NAME: &str = "ShadowMemory";

/// Name of the guest stack global.
pub const STACK_NAME: &str = "Stack";
