//! Narrow console-write contract. Real console/UART wiring is explicitly
//! out of scope per spec.md §1 (boot and console are external
//! collaborators); the only reason this core touches a console at all is
//! to give the structured logger (`crate::init_logging`) somewhere to
//! write. A deployed build supplies `corvid_console_write` the way
//! `hal.rs` expects its own extern hooks supplied; under test there is
//! nothing listening, and `write` is a no-op (scenario tests assert on
//! state directly, not on console output).

#[cfg(not(test))]
unsafe extern "Rust" {
    fn corvid_console_write(bytes: *const u8, len: usize);
}

#[cfg(not(test))]
pub fn write(s: &str) {
    unsafe { corvid_console_write(s.as_ptr(), s.len()) }
}

#[cfg(test)]
pub fn write(_s: &str) {}
