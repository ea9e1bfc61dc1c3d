//! Resource configuration bank.
//!
//! Configurations are keyed by a small integer tag. Tag 0 holds the default
//! configuration and is used by `enable`. Tags can be created or updated only
//! while the controller is disabled; querying the required memory size is
//! always allowed and never mutates anything.
use crate::error::Error;

/// Default resource configuration tag.
pub const DEFAULT_RESOURCE_CFG_TAG: u8 = 0;

/// Number of resource configuration tags the build supports.
pub const RESOURCE_CFG_TAG_COUNT: usize = 4;

/// Default maximum number of concurrent master links.
pub const DEFAULT_MASTER_COUNT: u8 = 1;

/// Default maximum number of concurrent slave links.
pub const DEFAULT_SLAVE_COUNT: u8 = 1;

/// Default maximum link-layer TX packet size.
pub const DEFAULT_TX_PACKET_SIZE: u8 = 27;

/// Default maximum link-layer RX packet size.
pub const DEFAULT_RX_PACKET_SIZE: u8 = 27;

/// Default link-layer TX packet count per link.
pub const DEFAULT_TX_PACKET_COUNT: u8 = 3;

/// Default link-layer RX packet count per link.
pub const DEFAULT_RX_PACKET_COUNT: u8 = 3;

/// Default maximum connection event length in microseconds.
pub const DEFAULT_EVENT_LENGTH_US: u32 = 7_500;

/// Smallest supported link-layer packet size.
pub const PACKET_SIZE_MIN: u8 = 27;

/// Largest supported link-layer packet size.
pub const PACKET_SIZE_MAX: u8 = 251;

/// Largest role count this build supports, per role.
pub const ROLE_COUNT_MAX: u8 = 4;

// Sizing model for the memory region carved at enable time. The numbers are
// per-build constants so that a size query is a pure function of the
// configuration.
const LINK_CONTEXT_SIZE: usize = 192;
const PACKET_OVERHEAD: usize = 8;
const BANK_ALIGN: usize = 4;

/// Message slots per transport queue direction.
pub const HCI_QUEUE_SLOTS: usize = 4;

/// Bytes of region memory reserved for the entropy pool. A power of two.
pub const RNG_POOL_SIZE: usize = 64;

// Worst-case alignment padding lost to carving.
const ARENA_SLACK: usize = 64;

/// Per-connection buffer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufferCfg {
    /// Link-layer TX packet size in bytes. Valid range: 27-251.
    pub tx_packet_size: u8,
    /// Link-layer RX packet size in bytes. Valid range: 27-251.
    pub rx_packet_size: u8,
    /// Link-layer TX packet count per link.
    pub tx_packet_count: u8,
    /// Link-layer RX packet count per link.
    pub rx_packet_count: u8,
}

/// A single configuration update, applied to one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Cfg {
    /// Maximum number of concurrent master roles.
    MasterCount(u8),
    /// Maximum number of concurrent slave roles.
    SlaveCount(u8),
    /// Per-connection buffer configuration.
    Buffer(BufferCfg),
    /// Maximum connection event length in microseconds.
    EventLength(u32),
}

/// A complete resource configuration under one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResourceCfg {
    pub master_count: u8,
    pub slave_count: u8,
    pub buffer_cfg: BufferCfg,
    pub event_length_us: u32,
}

impl Default for ResourceCfg {
    fn default() -> Self {
        ResourceCfg {
            master_count: DEFAULT_MASTER_COUNT,
            slave_count: DEFAULT_SLAVE_COUNT,
            buffer_cfg: BufferCfg {
                tx_packet_size: DEFAULT_TX_PACKET_SIZE,
                rx_packet_size: DEFAULT_RX_PACKET_SIZE,
                tx_packet_count: DEFAULT_TX_PACKET_COUNT,
                rx_packet_count: DEFAULT_RX_PACKET_COUNT,
            },
            event_length_us: DEFAULT_EVENT_LENGTH_US,
        }
    }
}

impl ResourceCfg {
    /// Total number of concurrent links this configuration provisions.
    pub fn link_count(&self) -> usize {
        usize::from(self.master_count) + usize::from(self.slave_count)
    }

    /// Bytes of region memory reserved for per-link contexts and packet
    /// pools under this configuration.
    pub fn link_memory(&self) -> usize {
        let buf = &self.buffer_cfg;
        let tx_pool = usize::from(buf.tx_packet_count) * align_up(usize::from(buf.tx_packet_size) + PACKET_OVERHEAD);
        let rx_pool = usize::from(buf.rx_packet_count) * align_up(usize::from(buf.rx_packet_size) + PACKET_OVERHEAD);
        self.link_count() * (LINK_CONTEXT_SIZE + tx_pool + rx_pool)
    }

    /// Bytes of caller-supplied memory required to enable under this
    /// configuration.
    ///
    /// This is a pure function of the configuration: two identical
    /// configurations always report the same size.
    pub fn required_memory(&self) -> usize {
        let hci = 2 * HCI_QUEUE_SLOTS * align_up(crate::hci::SLOT_SIZE);
        self.link_memory() + hci + RNG_POOL_SIZE + ARENA_SLACK
    }

    fn apply(&mut self, cfg: Cfg) -> Result<(), Error> {
        match cfg {
            Cfg::MasterCount(n) => {
                if n > ROLE_COUNT_MAX {
                    return Err(Error::EOPNOTSUPP);
                }
                self.master_count = n;
            }
            Cfg::SlaveCount(n) => {
                if n > ROLE_COUNT_MAX {
                    return Err(Error::EOPNOTSUPP);
                }
                self.slave_count = n;
            }
            Cfg::Buffer(buf) => {
                let sizes_ok = (PACKET_SIZE_MIN..=PACKET_SIZE_MAX).contains(&buf.tx_packet_size)
                    && (PACKET_SIZE_MIN..=PACKET_SIZE_MAX).contains(&buf.rx_packet_size);
                if !sizes_ok || buf.tx_packet_count == 0 || buf.rx_packet_count == 0 {
                    return Err(Error::EINVAL);
                }
                self.buffer_cfg = buf;
            }
            Cfg::EventLength(us) => {
                if us == 0 {
                    return Err(Error::EINVAL);
                }
                self.event_length_us = us;
            }
        }
        Ok(())
    }
}

/// The bank of resource configurations, indexed by tag.
///
/// The bank outlives enable/disable cycles: disabling the controller leaves
/// every tag exactly as configured.
pub struct ConfigBank {
    cfgs: [ResourceCfg; RESOURCE_CFG_TAG_COUNT],
    frozen: bool,
}

impl ConfigBank {
    pub const fn new() -> Self {
        ConfigBank {
            cfgs: [ResourceCfg {
                master_count: DEFAULT_MASTER_COUNT,
                slave_count: DEFAULT_SLAVE_COUNT,
                buffer_cfg: BufferCfg {
                    tx_packet_size: DEFAULT_TX_PACKET_SIZE,
                    rx_packet_size: DEFAULT_RX_PACKET_SIZE,
                    tx_packet_count: DEFAULT_TX_PACKET_COUNT,
                    rx_packet_count: DEFAULT_RX_PACKET_COUNT,
                },
                event_length_us: DEFAULT_EVENT_LENGTH_US,
            }; RESOURCE_CFG_TAG_COUNT],
            frozen: false,
        }
    }

    /// Apply a configuration update to `tag`, or query the required memory
    /// size for `tag` when `cfg` is `None`.
    ///
    /// A size query is always permitted and is pure. An update is rejected
    /// with [`Error::EAGAIN`] while the controller is enabled.
    pub fn set(&mut self, tag: u8, cfg: Option<Cfg>) -> Result<usize, Error> {
        let slot = self.cfgs.get_mut(usize::from(tag)).ok_or(Error::EINVAL)?;
        match cfg {
            None => Ok(slot.required_memory()),
            Some(cfg) => {
                if self.frozen {
                    return Err(Error::EAGAIN);
                }
                slot.apply(cfg)?;
                Ok(slot.required_memory())
            }
        }
    }

    /// The configuration stored under `tag`.
    pub fn get(&self, tag: u8) -> Result<&ResourceCfg, Error> {
        self.cfgs.get(usize::from(tag)).ok_or(Error::EINVAL)
    }

    /// Freeze the bank for the duration of an enable.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Unfreeze the bank on disable.
    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl Default for ConfigBank {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(n: usize) -> usize {
    (n + BANK_ALIGN - 1) & !(BANK_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tag_matches_documented_defaults() {
        let bank = ConfigBank::new();
        let cfg = bank.get(DEFAULT_RESOURCE_CFG_TAG).unwrap();
        assert_eq!(cfg.master_count, 1);
        assert_eq!(cfg.slave_count, 1);
        assert_eq!(cfg.buffer_cfg.tx_packet_size, 27);
        assert_eq!(cfg.buffer_cfg.rx_packet_size, 27);
        assert_eq!(cfg.buffer_cfg.tx_packet_count, 3);
        assert_eq!(cfg.buffer_cfg.rx_packet_count, 3);
        assert_eq!(cfg.event_length_us, 7_500);
    }

    #[test]
    fn size_query_is_pure_and_repeatable() {
        let mut bank = ConfigBank::new();
        let a = bank.set(0, None).unwrap();
        let b = bank.set(0, None).unwrap();
        assert_eq!(a, b);
        // Querying must not unfreeze, freeze or otherwise change state.
        assert!(!bank.is_frozen());
    }

    #[test]
    fn size_grows_with_links_and_buffers() {
        let mut bank = ConfigBank::new();
        let base = bank.set(1, None).unwrap();
        bank.set(1, Some(Cfg::MasterCount(2))).unwrap();
        let more_links = bank.set(1, None).unwrap();
        assert!(more_links > base);

        bank.set(
            1,
            Some(Cfg::Buffer(BufferCfg {
                tx_packet_size: 251,
                rx_packet_size: 251,
                tx_packet_count: 6,
                rx_packet_count: 6,
            })),
        )
        .unwrap();
        let bigger_buffers = bank.set(1, None).unwrap();
        assert!(bigger_buffers > more_links);
    }

    #[test]
    fn updates_rejected_while_frozen() {
        let mut bank = ConfigBank::new();
        bank.freeze();
        assert_eq!(bank.set(0, Some(Cfg::MasterCount(2))), Err(Error::EAGAIN));
        assert_eq!(bank.set(2, Some(Cfg::EventLength(5_000))), Err(Error::EAGAIN));
        // Queries still work while frozen.
        assert!(bank.set(0, None).is_ok());
        bank.unfreeze();
        assert!(bank.set(0, Some(Cfg::MasterCount(2))).is_ok());
    }

    #[test]
    fn enable_disable_is_identity_on_bank() {
        let mut bank = ConfigBank::new();
        bank.set(1, Some(Cfg::SlaveCount(3))).unwrap();
        let before = *bank.get(1).unwrap();
        bank.freeze();
        bank.unfreeze();
        assert_eq!(*bank.get(1).unwrap(), before);
    }

    #[test]
    fn validation_bounds() {
        let mut bank = ConfigBank::new();
        assert_eq!(bank.set(0, Some(Cfg::MasterCount(ROLE_COUNT_MAX + 1))), Err(Error::EOPNOTSUPP));
        let bad = BufferCfg {
            tx_packet_size: 26,
            rx_packet_size: 27,
            tx_packet_count: 3,
            rx_packet_count: 3,
        };
        assert_eq!(bank.set(0, Some(Cfg::Buffer(bad))), Err(Error::EINVAL));
        let bad = BufferCfg {
            tx_packet_size: 27,
            rx_packet_size: 252,
            tx_packet_count: 3,
            rx_packet_count: 3,
        };
        assert_eq!(bank.set(0, Some(Cfg::Buffer(bad))), Err(Error::EINVAL));
        assert_eq!(bank.set(RESOURCE_CFG_TAG_COUNT as u8, None), Err(Error::EINVAL));
    }
}
