//! Mach trap table discovery.
//!
//! `mach_trap_table` is an array of 128 `mach_trap_t` records, 32 bytes
//! each: argument counts and a munger pointer around the handler pointer. In
//! a release kernel most of that is zero, so the table shows up as a run of
//! 24-byte zero gaps exactly 32 bytes apart with handler pointers between
//! them. The first slot is `kern_invalid`.

use tracing::debug;

use crate::error::{Error, Result};
use crate::macho::{MachOImage, SectionInfo};
use crate::util::ByteView;

/// Number of slots in the trap table.
pub const MACH_TRAP_COUNT: usize = 128;

const TRAP_STRIDE: usize = 32;
const ZERO_RUN: usize = 24;
/// Consecutive zero gaps required to accept a candidate.
const SIGNATURE_GAPS: usize = 5;

/// Sections that may hold the table, searched in order.
const TRAP_SECTIONS: [(&str, &str); 3] = [
    ("__DATA", "__const"),
    ("__CONST", "__constdata"),
    ("__DATA_CONST", "__const"),
];

/// Names of the traps published in xnu's `osfmk/kern/syscall_sw.c`.
pub static MACH_TRAP_NAMES: [&str; MACH_TRAP_COUNT] = {
    let mut names = ["kern_invalid"; MACH_TRAP_COUNT];
    names[10] = "_kernelrpc_mach_vm_allocate_trap";
    names[12] = "_kernelrpc_mach_vm_deallocate_trap";
    names[14] = "_kernelrpc_mach_vm_protect_trap";
    names[15] = "_kernelrpc_mach_vm_map_trap";
    names[16] = "_kernelrpc_mach_port_allocate_trap";
    names[17] = "_kernelrpc_mach_port_destroy_trap";
    names[18] = "_kernelrpc_mach_port_deallocate_trap";
    names[19] = "_kernelrpc_mach_port_mod_refs_trap";
    names[20] = "_kernelrpc_mach_port_move_member_trap";
    names[21] = "_kernelrpc_mach_port_insert_right_trap";
    names[22] = "_kernelrpc_mach_port_insert_member_trap";
    names[23] = "_kernelrpc_mach_port_extract_member_trap";
    names[24] = "_kernelrpc_mach_port_construct_trap";
    names[25] = "_kernelrpc_mach_port_destruct_trap";
    names[26] = "mach_reply_port";
    names[27] = "thread_self_trap";
    names[28] = "task_self_trap";
    names[29] = "host_self_trap";
    names[31] = "mach_msg_trap";
    names[32] = "mach_msg_overwrite_trap";
    names[33] = "semaphore_signal_trap";
    names[34] = "semaphore_signal_all_trap";
    names[35] = "semaphore_signal_thread_trap";
    names[36] = "semaphore_wait_trap";
    names[37] = "semaphore_wait_signal_trap";
    names[38] = "semaphore_timedwait_trap";
    names[39] = "semaphore_timedwait_signal_trap";
    names[41] = "_kernelrpc_mach_port_guard_trap";
    names[42] = "_kernelrpc_mach_port_unguard_trap";
    names[43] = "mach_generate_activity_id";
    names[44] = "task_name_for_pid";
    names[45] = "task_for_pid";
    names[46] = "pid_for_task";
    names[48] = "macx_swapon";
    names[49] = "macx_swapoff";
    names[51] = "macx_triggers";
    names[52] = "macx_backing_store_suspend";
    names[53] = "macx_backing_store_recovery";
    names[58] = "pfz_exit";
    names[59] = "swtch_pri";
    names[60] = "swtch";
    names[61] = "thread_switch";
    names[62] = "clock_sleep_trap";
    names[70] = "host_create_mach_voucher_trap";
    names[72] = "mach_voucher_extract_attr_recipe_trap";
    names[89] = "mach_timebase_info_trap";
    names[90] = "mach_wait_until_trap";
    names[91] = "mk_timer_create_trap";
    names[92] = "mk_timer_destroy_trap";
    names[93] = "mk_timer_arm_trap";
    names[94] = "mk_timer_cancel_trap";
    names[100] = "iokit_user_client_trap";
    names
};

/// One populated slot of the trap table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachTrap {
    /// Trap number
    pub index: usize,
    /// Name from the published table
    pub name: &'static str,
    /// Handler address with the Thumb bit cleared
    pub address: u64,
    /// Handler address had the Thumb bit set
    pub thumb: bool,
}

/// A located trap table.
#[derive(Debug, Clone)]
pub struct TrapTable {
    /// File offset of the signature match
    pub file_offset: u64,
    /// Virtual address of the signature match
    pub vmaddr: u64,
    /// Handler shared by all unused slots
    pub kern_invalid: u64,
    /// Slots whose handler is neither zero nor `kern_invalid`
    pub traps: Vec<MachTrap>,
}

impl TrapTable {
    /// Locates and decodes the trap table in a kernel image.
    pub fn find(kernel: &MachOImage<'_>) -> Result<Self> {
        let sect = TRAP_SECTIONS
            .iter()
            .find_map(|(seg, sect)| kernel.section(seg, sect))
            .ok_or_else(|| {
                Error::not_found(
                    "section",
                    "__DATA.__const, __CONST.__constdata or __DATA_CONST.__const",
                )
            })?;
        debug!("searching {} for mach_trap_table", sect.full_name());

        let data = kernel.section_data(sect.section.segment_name(), sect.name())?;
        let start = locate(data).ok_or_else(|| Error::not_found("table", "mach_trap_table"))?;
        Self::decode(data, start, sect)
    }

    fn decode(data: &[u8], start: usize, sect: &SectionInfo) -> Result<Self> {
        let view = ByteView::new(data);
        let base = start - 8;
        let kern_invalid = view.u64_le(base)?;

        let mut traps = Vec::new();
        for index in 0..MACH_TRAP_COUNT {
            let Ok(mut address) = view.u64_le(base + index * TRAP_STRIDE) else {
                break;
            };
            if address == 0 || address == kern_invalid {
                continue;
            }
            let thumb = address % 4 == 1;
            if thumb {
                address -= 1;
            }
            traps.push(MachTrap {
                index,
                name: MACH_TRAP_NAMES[index],
                address,
                thumb,
            });
        }

        Ok(Self {
            file_offset: sect.section.offset as u64 + start as u64,
            vmaddr: sect.section.addr + start as u64,
            kern_invalid,
            traps,
        })
    }
}

/// Finds the first 8-aligned position with five zero gaps one stride apart,
/// preceded by a handler pointer and with another pointer after the first
/// gap.
fn locate(data: &[u8]) -> Option<usize> {
    let view = ByteView::new(data);
    let is_zero = |pos: usize| {
        view.bytes(pos, ZERO_RUN)
            .map(|b| b.iter().all(|&x| x == 0))
            .unwrap_or(false)
    };
    let nonzero = |pos: usize| view.u64_le(pos).map(|v| v != 0).unwrap_or(false);

    (8..data.len()).step_by(8).find(|&i| {
        (0..SIGNATURE_GAPS).all(|k| is_zero(i + k * TRAP_STRIDE))
            && nonzero(i - 8)
            && nonzero(i + ZERO_RUN)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::MH_EXECUTE;
    use crate::testutil::*;

    const INVALID: u64 = 0xfffffff007100000;

    fn trap_kernel() -> Vec<u8> {
        let mut buf = MachOBuilder::arm64(MH_EXECUTE)
            .segment(
                "__DATA_CONST",
                0xfffffff007200000,
                0x2000,
                0x1000,
                0x2000,
                &[sect("__const", 0xfffffff007200000, 0x2000, 0x1000)],
            )
            .build(0x3000);

        // Noise before the table.
        put_u64_le(&mut buf, 0x1000, 0x1234);
        let table = 0x1100;
        for slot in 0..MACH_TRAP_COUNT {
            put_u64_le(&mut buf, table + slot * 32, INVALID);
        }
        put_u64_le(&mut buf, table + 26 * 32, 0xfffffff007110000);
        put_u64_le(&mut buf, table + 31 * 32, 0xfffffff007120001);
        buf
    }

    #[test]
    fn test_find_trap_table() {
        let data = trap_kernel();
        let image = MachOImage::parse(&data).unwrap();
        let table = TrapTable::find(&image).unwrap();

        assert_eq!(table.kern_invalid, INVALID);
        assert_eq!(table.file_offset, 0x1108);
        assert_eq!(table.vmaddr, 0xfffffff007200108);
        assert_eq!(table.traps.len(), 2);
        assert_eq!(table.traps[0].name, "mach_reply_port");
        assert!(!table.traps[0].thumb);
        assert_eq!(table.traps[1].name, "mach_msg_trap");
        assert_eq!(table.traps[1].address, 0xfffffff007120000);
        assert!(table.traps[1].thumb);
    }

    #[test]
    fn test_no_table() {
        let data = MachOBuilder::arm64(MH_EXECUTE)
            .segment(
                "__DATA",
                0x1000,
                0x100,
                0x100,
                0x100,
                &[sect("__const", 0x1000, 0x100, 0x100)],
            )
            .build(0x200);
        let image = MachOImage::parse(&data).unwrap();
        assert!(matches!(
            TrapTable::find(&image),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_name_table() {
        assert_eq!(MACH_TRAP_NAMES[0], "kern_invalid");
        assert_eq!(MACH_TRAP_NAMES[100], "iokit_user_client_trap");
        assert_eq!(MACH_TRAP_NAMES[127], "kern_invalid");
    }
}
