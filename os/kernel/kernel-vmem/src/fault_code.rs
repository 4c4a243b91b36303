use bitfield_struct::bitfield;

/// Page-fault error code layout (x86-64).
///
/// Pushed by the CPU on `#PF`; together with `CR2` it is everything the fault
/// path learns about the access.
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool,

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool,

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool,

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool,

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool,

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool,

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool,

    #[bits(57)]
    __: u64,
}

impl PageFaultErrorCode {
    /// One-line human description for fault logs.
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}
