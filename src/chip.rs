//! Chip-family capabilities.
//!
//! The family is detected once per session and stored in the session state
//! as a capability-tagged variant. Handlers match on the variant; the
//! generic variant runs only the memory polls.

use axerrno::AxResult;

use crate::platform::PhysMemory;
use crate::regs::Mmio;

/// Physical base of the PXA interrupt controller.
pub const PXA_IRQ_CTRL_PHYS: u32 = 0x40d0_0000;
/// Physical base of the PXA GPIO controller.
pub const PXA_GPIO_CTRL_PHYS: u32 = 0x40e0_0000;

/// Chip capability provider supplied by the machine layer.
pub trait ChipOps {
    /// Identify the running chip family.
    fn detect_family(&self) -> FamilyKind;

    /// Write back and invalidate caches so patched vectors are fetched.
    fn flush_icache(&self);

    /// Human-readable name of interrupt source `irq`.
    fn irq_name(&self, irq: u32) -> &str;
}

/// Result of chip detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKind {
    Generic,
    /// Intel XScale core (PXA2xx/PXA27x).
    XScale,
}

/// Mapped controller blocks needed by the XScale handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XScaleBlocks {
    pub irq_ctrl: Mmio,
    pub gpio_ctrl: Mmio,
}

/// Chip family selected for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    Generic,
    XScale(XScaleBlocks),
}

impl ChipFamily {
    /// Detect the family and map whatever controller blocks it needs.
    pub fn select<P: ChipOps + PhysMemory>(platform: &P) -> AxResult<Self> {
        match platform.detect_family() {
            FamilyKind::XScale if cfg!(feature = "xscale") => {
                let blocks = XScaleBlocks {
                    irq_ctrl: map_block(platform, PXA_IRQ_CTRL_PHYS)?,
                    gpio_ctrl: map_block(platform, PXA_GPIO_CTRL_PHYS)?,
                };
                debug!(
                    "chip: xscale irq_ctrl={:#010x} gpio_ctrl={:#010x}",
                    blocks.irq_ctrl.base(),
                    blocks.gpio_ctrl.base()
                );
                Ok(Self::XScale(blocks))
            }
            FamilyKind::XScale => {
                warn!("chip: xscale detected but support is not built in, using generic handlers");
                Ok(Self::Generic)
            }
            FamilyKind::Generic => Ok(Self::Generic),
        }
    }

    pub fn is_xscale(&self) -> bool {
        matches!(self, Self::XScale(_))
    }
}

fn map_block<P: PhysMemory>(platform: &P, paddr: u32) -> AxResult<Mmio> {
    let vaddr = platform
        .map_phys(paddr)
        .ok_or_else(|| axerrno::ax_err_type!(BadAddress, "cannot map controller block"))?;
    let vaddr = u32::try_from(vaddr)
        .map_err(|_| axerrno::ax_err_type!(BadAddress, "controller block mapped out of range"))?;
    Ok(Mmio::new(vaddr))
}
