//! # Device Inventory
//!
//! Read-only description of a device's compute units and memory banks,
//! produced by hardware discovery and handed to the session layer once.

use std::collections::BTreeMap;

use accel_core::{BankIndex, ByteSize, CuIndex, DeviceAddr, DeviceIndex, Error, Result};

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Compute unit properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CuFlags: u32 {
        /// Multiple sessions may share the compute unit
        const SHARED = 1 << 0;
        /// Software-programmable co-processor kernel
        const SOFT_KERNEL = 1 << 1;
        /// Kernel multiplexes independent channels
        const CHANNELS = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Memory bank properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BankFlags: u32 {
        /// Not host addressable
        const DEVICE_ONLY = 1 << 0;
    }
}

// =============================================================================
// COMPUTE UNIT
// =============================================================================

/// One schedulable execution unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeUnit {
    /// Index within the device
    pub index: CuIndex,
    /// Instance name, e.g. `scaler:scaler_1`
    pub name: String,
    /// Register base address
    pub base_address: DeviceAddr,
    /// Properties
    pub flags: CuFlags,
    /// Kernel argument number to memory bank
    pub arg_banks: BTreeMap<u32, BankIndex>,
    /// Bank used for arguments without an explicit mapping
    pub default_bank: Option<BankIndex>,
}

impl ComputeUnit {
    /// Create a compute unit with no argument mapping
    pub fn new(index: u32, name: &str, base_address: u64) -> Self {
        Self {
            index: CuIndex::new(index),
            name: name.to_owned(),
            base_address: DeviceAddr::new(base_address),
            flags: CuFlags::empty(),
            arg_banks: BTreeMap::new(),
            default_bank: None,
        }
    }

    /// Set flags
    pub fn with_flags(mut self, flags: CuFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Map a kernel argument to a bank
    pub fn with_arg_bank(mut self, arg: u32, bank: u32) -> Self {
        self.arg_banks.insert(arg, BankIndex::new(bank));
        self
    }

    /// Set the default bank
    pub fn with_default_bank(mut self, bank: u32) -> Self {
        self.default_bank = Some(BankIndex::new(bank));
        self
    }

    /// Bank an argument lives in
    pub fn bank_for_arg(&self, arg: u32) -> Option<BankIndex> {
        self.arg_banks.get(&arg).copied().or(self.default_bank)
    }

    /// Whether this is a co-processor kernel
    pub fn is_soft_kernel(&self) -> bool {
        self.flags.contains(CuFlags::SOFT_KERNEL)
    }

    /// Whether the unit may be shared between sessions
    pub fn is_shared(&self) -> bool {
        self.flags.contains(CuFlags::SHARED)
    }
}

// =============================================================================
// MEMORY BANK
// =============================================================================

/// One device memory bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBank {
    /// Index within the device
    pub index: BankIndex,
    /// Tag, e.g. `DDR[0]`
    pub name: String,
    /// First address of the bank
    pub base_address: DeviceAddr,
    /// Bank capacity
    pub size: ByteSize,
    /// Properties
    pub flags: BankFlags,
}

impl MemoryBank {
    /// Create a host-addressable bank
    pub fn new(index: u32, name: &str, base_address: u64, size: ByteSize) -> Self {
        Self {
            index: BankIndex::new(index),
            name: name.to_owned(),
            base_address: DeviceAddr::new(base_address),
            size,
            flags: BankFlags::empty(),
        }
    }

    /// Set flags
    pub fn with_flags(mut self, flags: BankFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the bank is device-only
    pub fn is_device_only(&self) -> bool {
        self.flags.contains(BankFlags::DEVICE_ONLY)
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// Inventory of one accelerator device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    index: DeviceIndex,
    name: String,
    compute_units: Vec<ComputeUnit>,
    banks: Vec<MemoryBank>,
}

impl Device {
    /// Start building a device inventory
    pub fn builder(index: u32, name: &str) -> DeviceBuilder {
        DeviceBuilder {
            index: DeviceIndex::new(index),
            name: name.to_owned(),
            compute_units: Vec::new(),
            banks: Vec::new(),
        }
    }

    /// Device index
    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All compute units
    pub fn compute_units(&self) -> &[ComputeUnit] {
        &self.compute_units
    }

    /// All memory banks
    pub fn banks(&self) -> &[MemoryBank] {
        &self.banks
    }

    /// Look up a compute unit
    pub fn compute_unit(&self, index: CuIndex) -> Result<&ComputeUnit> {
        self.compute_units
            .iter()
            .find(|cu| cu.index == index)
            .ok_or(Error::NotFound)
    }

    /// Look up a memory bank
    pub fn bank(&self, index: BankIndex) -> Result<&MemoryBank> {
        self.banks
            .iter()
            .find(|bank| bank.index == index)
            .ok_or(Error::NotFound)
    }
}

/// Builder validating a device inventory
#[derive(Debug)]
pub struct DeviceBuilder {
    index: DeviceIndex,
    name: String,
    compute_units: Vec<ComputeUnit>,
    banks: Vec<MemoryBank>,
}

impl DeviceBuilder {
    /// Add a compute unit
    pub fn compute_unit(mut self, cu: ComputeUnit) -> Self {
        self.compute_units.push(cu);
        self
    }

    /// Add a memory bank
    pub fn bank(mut self, bank: MemoryBank) -> Self {
        self.banks.push(bank);
        self
    }

    /// Validate and build
    ///
    /// Fails with `InvalidParameter` on duplicate indices, empty banks, or
    /// argument maps that reference a bank the device does not have.
    pub fn build(mut self) -> Result<Device> {
        self.compute_units.sort_by_key(|cu| cu.index);
        self.banks.sort_by_key(|bank| bank.index);

        if self.compute_units.windows(2).any(|w| w[0].index == w[1].index) {
            return Err(Error::InvalidParameter);
        }
        if self.banks.windows(2).any(|w| w[0].index == w[1].index) {
            return Err(Error::InvalidParameter);
        }
        if self.banks.iter().any(|bank| bank.size.is_zero()) {
            return Err(Error::InvalidParameter);
        }

        let has_bank = |index: BankIndex| self.banks.iter().any(|bank| bank.index == index);
        for cu in &self.compute_units {
            let mapped = cu.arg_banks.values().copied().chain(cu.default_bank);
            for bank in mapped {
                if !has_bank(bank) {
                    log::warn!("{} ({}) maps to missing {}", cu.index, cu.name, bank);
                    return Err(Error::InvalidParameter);
                }
            }
        }

        Ok(Device {
            index: self.index,
            name: self.name,
            compute_units: self.compute_units,
            banks: self.banks,
        })
    }
}
