//! Exception handler chain installer.
//!
//! The host reaches its interrupt and abort handlers through `ldr pc,
//! [pc, #imm]` trampolines in the high vector page. Installing the chain
//! means pointing those literals at relocated dispatch code that calls the
//! [`crate::handler`] producers and then, unless the event was ours, jumps to
//! the original target.
//!
//! ```text
//! Idle -> Located -> Allocated -> Patched -> Restored -> Idle
//! ```
//!
//! A failure before `Patched` releases whatever was allocated. Restore writes
//! back exactly the values captured during patching.
//!
//! On ARM the dispatch image is the crate's own handler section (see
//! [`DispatchImage::builtin`]): the assembly stubs, their [`AsmVars`] and the
//! handler entry points are all copied into the block, so nothing outside
//! the block runs while an exception is being handled.

use core::mem::{offset_of, size_of};
use core::ptr;

use axerrno::{AxError, AxResult};

use crate::chip::ChipFamily;
use crate::config::SessionConfig;
use crate::debug;
use crate::platform::{MemAttrs, PhysBlock, Platform};
use crate::regs::{IrqGuard, MemoryBus};
use crate::state::SessionState;

/// Virtual address of the high exception vector page.
pub const VECTOR_BASE: u32 = 0xffff_0000;
/// Size of each per-exception stack in the handler block.
pub const STACK_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = 4096;

const LDR_PC_MASK: u32 = 0xffff_f000;
const LDR_PC_INSN: u32 = 0xe59f_f000;
/// `pc` reads two instructions ahead.
const PC_BIAS: u32 = 8;

/// Exception vector slots redirected by the chain.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorSlot {
    Prefetch = 0x0c,
    DataAbort = 0x10,
    Irq = 0x18,
}

impl VectorSlot {
    pub const ALL: [Self; 3] = [Self::Irq, Self::DataAbort, Self::Prefetch];

    pub const fn offset(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Prefetch => "prefetch",
            Self::DataAbort => "abort",
            Self::Irq => "irq",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Irq => 0,
            Self::DataAbort => 1,
            Self::Prefetch => 2,
        }
    }
}

/// Offset of the literal loaded by a vector trampoline, relative to the
/// vector slot. `None` for any other instruction.
pub fn decode_trampoline(insn: u32) -> Option<u32> {
    if insn & LDR_PC_MASK != LDR_PC_INSN {
        return None;
    }
    Some((insn & 0xfff) + PC_BIAS)
}

/// Variables read by the relocated dispatch code.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsmVars {
    /// Address of the session state as seen from exception context.
    pub state_mva: u32,
    pub orig_irq: u32,
    pub orig_abort: u32,
    pub orig_prefetch: u32,
}

impl AsmVars {
    fn set_original(&mut self, slot: VectorSlot, target: u32) {
        match slot {
            VectorSlot::Irq => self.orig_irq = target,
            VectorSlot::DataAbort => self.orig_abort = target,
            VectorSlot::Prefetch => self.orig_prefetch = target,
        }
    }
}

/// Position-independent dispatch code copied into the handler block.
///
/// Offsets are relative to the start of `code`. Entry points and the
/// variables are word aligned.
#[derive(Debug, Clone, Copy)]
pub struct DispatchImage {
    pub code: &'static [u8],
    /// Location of the [`AsmVars`] record.
    pub vars_offset: usize,
    pub irq_entry: usize,
    pub abort_entry: usize,
    pub prefetch_entry: usize,
}

impl DispatchImage {
    /// Describe code linked at `code` whose variables and entry points are
    /// given as absolute addresses. `None` if any of them falls outside the
    /// code or is misaligned.
    pub fn from_symbols(
        code: &'static [u8],
        vars: usize,
        irq: usize,
        abort: usize,
        prefetch: usize,
    ) -> Option<Self> {
        let base = code.as_ptr() as usize;
        let image = Self {
            code,
            vars_offset: vars.checked_sub(base)?,
            irq_entry: irq.checked_sub(base)?,
            abort_entry: abort.checked_sub(base)?,
            prefetch_entry: prefetch.checked_sub(base)?,
        };
        image.is_valid().then_some(image)
    }

    /// The crate's linked handler section. `None` on targets that have no
    /// exception vectors to chain.
    pub fn builtin() -> Option<Self> {
        #[cfg(target_arch = "arm")]
        {
            crate::dispatch::image()
        }
        #[cfg(not(target_arch = "arm"))]
        {
            None
        }
    }

    fn entry(&self, slot: VectorSlot) -> usize {
        match slot {
            VectorSlot::Irq => self.irq_entry,
            VectorSlot::DataAbort => self.abort_entry,
            VectorSlot::Prefetch => self.prefetch_entry,
        }
    }

    fn is_valid(&self) -> bool {
        let len = self.code.len();
        let vars_fit = self
            .vars_offset
            .checked_add(size_of::<AsmVars>())
            .is_some_and(|end| end <= len);
        vars_fit
            && self.vars_offset % 4 == 0
            && [self.irq_entry, self.abort_entry, self.prefetch_entry]
                .iter()
                .all(|entry| *entry < len && *entry % 4 == 0)
    }
}

/// Fixed head of the handler block: stacks followed by the session state.
/// The dispatch image starts at [`CODE_OFFSET`].
#[repr(C)]
pub struct ChainHeader {
    pub prefetch_stack: [u8; STACK_SIZE],
    pub abort_stack: [u8; STACK_SIZE],
    pub irq_stack: [u8; STACK_SIZE],
    pub state: SessionState,
}

/// Offset of the session state in the handler block.
pub const STATE_OFFSET: usize = offset_of!(ChainHeader, state);
/// Offset of the dispatch image in the handler block.
pub const CODE_OFFSET: usize = size_of::<ChainHeader>().next_multiple_of(PAGE_SIZE);

/// Handler block size for `image`.
pub const fn block_size(image: &DispatchImage) -> usize {
    CODE_OFFSET + image.code.len()
}

/// Installer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerState {
    Idle,
    Located,
    Allocated,
    Patched,
    Restored,
}

/// Installer setup failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A vector slot does not hold a recognized trampoline.
    UnknownVector { offset: u32, insn: u32 },
    /// The vector page could not be translated or mapped.
    MapFailed,
    /// The handler block could not be allocated.
    NoMemory,
    /// The dispatch image offsets fall outside its code.
    BadImage,
    /// The handlers are already installed.
    AlreadyInstalled,
    /// Operation called in the wrong installer state.
    OutOfOrder(InstallerState),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnknownVector { offset, insn } => {
                write!(f, "Unknown vector instruction {:08x} at offset {:#x}", insn, offset)
            }
            Self::MapFailed => write!(f, "Cannot map the exception vector page"),
            Self::NoMemory => write!(f, "Cannot allocate memory for the handler chain"),
            Self::BadImage => write!(f, "Dispatch image offsets out of range"),
            Self::AlreadyInstalled => write!(f, "Exception handlers already installed"),
            Self::OutOfOrder(state) => write!(f, "Installer operation invalid in state {:?}", state),
        }
    }
}

impl core::error::Error for Error {}

impl From<Error> for AxError {
    fn from(err: Error) -> Self {
        warn!("chain: {}", err);
        match err {
            Error::UnknownVector { .. } => AxError::Unsupported,
            Error::MapFailed => AxError::BadAddress,
            Error::NoMemory => AxError::NoMemory,
            Error::BadImage => AxError::InvalidInput,
            Error::AlreadyInstalled => AxError::AlreadyExists,
            Error::OutOfOrder(_) => AxError::BadState,
        }
    }
}

/// Handler chain for one session.
///
/// Dropping the chain restores the vectors and releases the block.
pub struct HandlerChain<'p, P: Platform> {
    platform: &'p P,
    image: &'p DispatchImage,
    status: InstallerState,
    /// Literal addresses in the mapped vector page, in `VectorSlot::ALL` order.
    sites: [u32; 3],
    originals: [u32; 3],
    block: Option<PhysBlock>,
}

impl<'p, P: Platform> HandlerChain<'p, P> {
    pub fn new(platform: &'p P, image: &'p DispatchImage) -> Self {
        Self {
            platform,
            image,
            status: InstallerState::Idle,
            sites: [0; 3],
            originals: [0; 3],
            block: None,
        }
    }

    /// Locate, allocate and patch in one go.
    pub fn install(
        platform: &'p P,
        image: &'p DispatchImage,
        config: &SessionConfig,
    ) -> AxResult<Self> {
        let mut chain = Self::new(platform, image);
        chain.locate()?;
        chain.allocate(config)?;
        chain.patch()?;
        Ok(chain)
    }

    pub fn installer_state(&self) -> InstallerState {
        self.status
    }

    fn expect_state(&self, expected: InstallerState) -> Result<(), Error> {
        match self.status {
            s if s == expected => Ok(()),
            InstallerState::Patched => Err(Error::AlreadyInstalled),
            s => Err(Error::OutOfOrder(s)),
        }
    }

    /// Find the literal behind each vector trampoline.
    pub fn locate(&mut self) -> AxResult {
        self.expect_state(InstallerState::Idle)?;
        let page = self.map_vector_page()?;
        let bus = self.platform.bus();
        let mut sites = [0; 3];
        for slot in VectorSlot::ALL {
            let insn = bus.read32(page + slot.offset());
            let Some(literal) = decode_trampoline(insn) else {
                return Err(Error::UnknownVector {
                    offset: slot.offset(),
                    insn,
                }
                .into());
            };
            sites[slot.index()] = page + slot.offset() + literal;
            debug!("chain: {} vector literal at {:#010x}", slot.name(), sites[slot.index()]);
        }
        self.sites = sites;
        self.status = InstallerState::Located;
        Ok(())
    }

    fn map_vector_page(&self) -> Result<u32, Error> {
        let paddr = self
            .platform
            .virt_to_phys(VECTOR_BASE)
            .ok_or(Error::MapFailed)?;
        let vaddr = self.platform.map_phys(paddr).ok_or(Error::MapFailed)?;
        u32::try_from(vaddr).map_err(|_| Error::MapFailed)
    }

    /// Allocate and fill the handler block: zeroed stacks, the session
    /// state built from `config`, and a copy of the dispatch image.
    pub fn allocate(&mut self, config: &SessionConfig) -> AxResult {
        self.expect_state(InstallerState::Located)?;
        if !self.image.is_valid() {
            return Err(Error::BadImage.into());
        }
        let family = ChipFamily::select(self.platform)?;

        let size = block_size(self.image);
        let block = self
            .platform
            .alloc_phys(size, MemAttrs::HANDLER_BLOCK)
            .ok_or(Error::NoMemory)?;
        if block.virt.is_null() || block.virt.align_offset(align_of::<ChainHeader>()) != 0 {
            self.platform.free_phys(block);
            return Err(Error::NoMemory.into());
        }

        unsafe {
            ptr::write_bytes(block.virt, 0, size);
            ptr::copy_nonoverlapping(
                self.image.code.as_ptr(),
                block.virt.add(CODE_OFFSET),
                self.image.code.len(),
            );
            SessionState::init_in_place(block.virt.add(STATE_OFFSET).cast(), config, family);
        }
        self.block = Some(block);
        self.write_vars(AsmVars {
            state_mva: block.mva + STATE_OFFSET as u32,
            ..AsmVars::default()
        });

        info!(
            "chain: block phys={:#010x} mva={:#010x} size={:#x} code={:#x}",
            block.phys,
            block.mva,
            size,
            self.image.code.len()
        );
        self.status = InstallerState::Allocated;
        Ok(())
    }

    fn vars_ptr(&self, block: &PhysBlock) -> *mut AsmVars {
        unsafe {
            block
                .virt
                .add(CODE_OFFSET + self.image.vars_offset)
                .cast()
        }
    }

    fn write_vars(&self, vars: AsmVars) {
        if let Some(block) = &self.block {
            unsafe { self.vars_ptr(block).write_unaligned(vars) };
        }
    }

    /// Dispatch variables currently in the block.
    pub fn vars(&self) -> Option<AsmVars> {
        let block = self.block.as_ref()?;
        Some(unsafe { self.vars_ptr(block).read_unaligned() })
    }

    /// Address of `slot`'s dispatch entry as seen from exception context.
    pub fn entry_mva(&self, slot: VectorSlot) -> Option<u32> {
        let block = self.block.as_ref()?;
        Some(block.mva + (CODE_OFFSET + self.image.entry(slot)) as u32)
    }

    /// Capture the original vector targets and redirect them to the
    /// dispatch code.
    pub fn patch(&mut self) -> AxResult {
        self.expect_state(InstallerState::Allocated)?;
        let (Some(arming), Some(mut vars)) = (
            self.state()
                .map(|s| s.family().is_xscale().then(|| *s.debug())),
            self.vars(),
        ) else {
            return Err(Error::OutOfOrder(self.status).into());
        };
        let platform = self.platform;
        let bus = platform.bus();
        let mut targets = [0; 3];
        for slot in VectorSlot::ALL {
            let original = bus.read32(self.sites[slot.index()]);
            self.originals[slot.index()] = original;
            vars.set_original(slot, original);
            targets[slot.index()] = self.entry_mva(slot).unwrap_or(original);
            info!(
                "chain: {} {:#010x}@{:#010x} -> {:#010x}",
                slot.name(),
                original,
                self.sites[slot.index()],
                targets[slot.index()]
            );
        }
        self.write_vars(vars);

        info!("Replacing exception handlers...");
        {
            let cpu = platform.cpu();
            let _guard = IrqGuard::new(cpu);
            if let Some(cfg) = &arming {
                debug::arm(cpu, cfg);
            }
            for slot in VectorSlot::ALL {
                bus.write32(self.sites[slot.index()], targets[slot.index()]);
            }
            platform.flush_icache();
        }
        info!("Finished installing exception handlers.");
        self.status = InstallerState::Patched;
        Ok(())
    }

    /// Put the original vector targets back. A no-op unless patched.
    ///
    /// The block stays allocated so the trace ring can still be drained.
    pub fn restore(&mut self) {
        if self.status != InstallerState::Patched {
            return;
        }
        info!("Restoring exception handlers...");
        {
            let cpu = self.platform.cpu();
            let bus = self.platform.bus();
            let _guard = IrqGuard::new(cpu);
            if self.state().is_some_and(|s| s.family().is_xscale()) {
                debug::disarm(cpu);
            }
            for slot in VectorSlot::ALL {
                bus.write32(self.sites[slot.index()], self.originals[slot.index()]);
            }
            self.platform.flush_icache();
        }
        info!("Finished restoring exception handlers.");
        self.status = InstallerState::Restored;
    }

    /// Restore if needed and free the handler block.
    pub fn release(&mut self) {
        self.restore();
        if let Some(block) = self.block.take() {
            self.platform.free_phys(block);
        }
        self.status = InstallerState::Idle;
    }

    /// Session state inside the handler block.
    pub fn state(&self) -> Option<&SessionState> {
        let block = self.block.as_ref()?;
        Some(unsafe { &*block.virt.add(STATE_OFFSET).cast::<SessionState>() })
    }
}

impl<P: Platform> Drop for HandlerChain<'_, P> {
    fn drop(&mut self) {
        self.release();
    }
}
