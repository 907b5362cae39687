//! # Simulated Device
//!
//! In-memory device implementing both collaborator traits. Dispatched
//! commands stay pending until the test (or demo) finishes them; finished
//! commands are then handed out by `poll`.

use std::collections::{BTreeMap, VecDeque};

use accel_core::{
    BankIndex, ByteSize, CommandId, CommandState, CuIndex, Error, Result, SlotIndex,
};
use spin::Mutex;

use crate::dispatch::{Completion, DispatchRequest, Dispatcher};
use crate::inventory::{BankFlags, ComputeUnit, CuFlags, Device, MemoryBank};
use crate::memory::{DeviceBuffer, DeviceMemory};

/// Allocation granularity of the simulated banks
const SIM_ALIGNMENT: u64 = 4096;

/// A command the simulated device has accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedCommand {
    /// Target compute unit
    pub cu: CuIndex,
    /// Bound slot
    pub slot: SlotIndex,
    /// Identifier
    pub command: CommandId,
    /// Copy of the payload
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct SimState {
    pending: VecDeque<DispatchedCommand>,
    finished: VecDeque<Completion>,
    bank_cursor: BTreeMap<BankIndex, u64>,
    next_handle: u64,
    live_buffers: usize,
    dispatched: u64,
    fail_next_dispatch: bool,
}

/// Simulated accelerator
#[derive(Debug)]
pub struct SimDevice {
    device: Device,
    state: Mutex<SimState>,
}

impl SimDevice {
    /// Wrap an inventory
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Two compute units (one co-processor kernel) and two banks
    pub fn reference_device() -> Device {
        let built = Device::builder(0, "sim0")
            .bank(MemoryBank::new(0, "DDR[0]", 0x0, ByteSize::from_mib(64)))
            .bank(
                MemoryBank::new(1, "DDR[1]", 0x1_0000_0000, ByteSize::from_mib(64))
                    .with_flags(BankFlags::DEVICE_ONLY),
            )
            .compute_unit(
                ComputeUnit::new(0, "scaler:scaler_0", 0x0180_0000)
                    .with_flags(CuFlags::SHARED)
                    .with_arg_bank(0, 0)
                    .with_arg_bank(1, 1)
                    .with_default_bank(0),
            )
            .compute_unit(
                ComputeUnit::new(1, "psk:psk_0", 0x0181_0000)
                    .with_flags(CuFlags::SOFT_KERNEL)
                    .with_default_bank(0),
            )
            .build();

        match built {
            Ok(device) => device,
            Err(e) => unreachable!("reference inventory is valid: {}", e),
        }
    }

    /// Inventory this device was built from
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Commands accepted but not yet finished, oldest first
    pub fn pending(&self) -> Vec<DispatchedCommand> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// Number of commands accepted but not yet finished
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Total commands accepted
    pub fn dispatched(&self) -> u64 {
        self.state.lock().dispatched
    }

    /// Finish a pending command; it is reported by the next `poll`
    pub fn finish(&self, command: CommandId, state: CommandState, return_code: i32) -> Result<()> {
        let mut sim = self.state.lock();
        let pos = sim
            .pending
            .iter()
            .position(|c| c.command == command)
            .ok_or(Error::NotFound)?;
        sim.pending.remove(pos);
        sim.finished
            .push_back(Completion::new(command, state, return_code));
        Ok(())
    }

    /// Finish the oldest pending command
    pub fn finish_oldest(&self, state: CommandState, return_code: i32) -> Option<CommandId> {
        let mut sim = self.state.lock();
        let cmd = sim.pending.pop_front()?;
        sim.finished
            .push_back(Completion::new(cmd.command, state, return_code));
        Some(cmd.command)
    }

    /// Queue an arbitrary completion, pending or not
    pub fn inject(&self, completion: Completion) {
        self.state.lock().finished.push_back(completion);
    }

    /// Make the next `dispatch` call fail
    pub fn fail_next_dispatch(&self) {
        self.state.lock().fail_next_dispatch = true;
    }

    /// Buffers allocated and not yet freed
    pub fn live_buffers(&self) -> usize {
        self.state.lock().live_buffers
    }
}

impl Dispatcher for SimDevice {
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<()> {
        self.device.compute_unit(request.cu)?;

        let mut sim = self.state.lock();
        if core::mem::take(&mut sim.fail_next_dispatch) {
            log::debug!("sim: rejecting {} on {}", request.command, request.cu);
            return Err(Error::SubmissionFailed);
        }

        sim.pending.push_back(DispatchedCommand {
            cu: request.cu,
            slot: request.slot,
            command: request.command,
            payload: request.payload.to_vec(),
        });
        sim.dispatched += 1;
        Ok(())
    }

    fn poll(&self, out: &mut Vec<Completion>) -> Result<usize> {
        let mut sim = self.state.lock();
        let n = sim.finished.len();
        out.extend(sim.finished.drain(..));
        Ok(n)
    }
}

impl DeviceMemory for SimDevice {
    fn allocate(&self, bank: BankIndex, size: ByteSize, device_only: bool) -> Result<DeviceBuffer> {
        let info = self.device.bank(bank)?;
        if size.is_zero() {
            return Err(Error::InvalidParameter);
        }
        if info.is_device_only() && !device_only {
            // Host-visible buffers cannot live in a device-only bank.
            return Err(Error::InvalidParameter);
        }

        let mut sim = self.state.lock();
        let cursor = sim.bank_cursor.entry(bank).or_insert(0);
        let offset = *cursor;
        let aligned = (size.as_bytes() + SIM_ALIGNMENT - 1) & !(SIM_ALIGNMENT - 1);
        if offset + aligned > info.size.as_bytes() {
            return Err(Error::OutOfDeviceMemory);
        }
        *cursor += aligned;

        sim.next_handle += 1;
        sim.live_buffers += 1;
        Ok(DeviceBuffer {
            handle: sim.next_handle,
            bank,
            addr: info.base_address + offset,
            size,
            device_only,
        })
    }

    fn free(&self, _buffer: DeviceBuffer) {
        let mut sim = self.state.lock();
        sim.live_buffers = sim.live_buffers.saturating_sub(1);
    }
}
