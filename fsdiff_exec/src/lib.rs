//! Executor supervision for fsdiff.
//!
//! The supervisor talks to a long-lived helper executor process through
//! two shared-memory arenas (program in, results out) and a pair of
//! control pipes. One executor session exists per filesystem root; the
//! [`env::Env`] owns the arenas and the session map.

pub mod command;
pub mod env;
pub mod gate;
pub mod report;
pub mod repro;
pub mod serialization;
pub mod shm;

use iota::iota;

/// Environment flag word shared with the executor via the input arena
/// header.
pub type EnvFlags = u64;

iota! {
    pub const FLAG_DEBUG: EnvFlags = 1 << (iota);   // debug output from executor
        , FLAG_SIGNAL                               // collect feedback signals (coverage)
        , FLAG_THREADED                             // use multiple threads to mitigate blocked syscalls
        , FLAG_COLLIDE                              // collide syscalls to provoke data races
        , FLAG_SANDBOX_SETUID                       // impersonate nobody user
        , FLAG_SANDBOX_NAMESPACE                    // use namespaces for sandboxing
        , FLAG_ENABLE_TUN                           // initialize and use tun in executor
        , FLAG_REPRO                                // reproduction mode
}

pub fn sandbox_to_flags(sandbox: &str) -> Option<EnvFlags> {
    match sandbox {
        "none" => Some(0),
        "setuid" => Some(FLAG_SANDBOX_SETUID),
        "namespace" => Some(FLAG_SANDBOX_NAMESPACE),
        _ => None,
    }
}

/// Per-exec options, encoded as one flag byte on the control pipe.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOpt {
    pub cover: bool,
    pub dedup: bool,
    pub need_state: bool,
}

impl ExecOpt {
    pub const fn state_only() -> Self {
        Self {
            cover: false,
            dedup: false,
            need_state: true,
        }
    }
}

/// Size of the program serialization arena, header included.
pub const PROG_BUFFER_SIZE: usize = 2 << 20;
/// Size of the output arena.
pub const OUTPUT_SIZE: usize = 16 << 20;
/// Input arena header: flag word then worker pid, both little-endian.
pub const IN_HEADER_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_distinct_bits() {
        let flags = [
            FLAG_DEBUG,
            FLAG_SIGNAL,
            FLAG_THREADED,
            FLAG_COLLIDE,
            FLAG_SANDBOX_SETUID,
            FLAG_SANDBOX_NAMESPACE,
            FLAG_ENABLE_TUN,
            FLAG_REPRO,
        ];
        let mut seen = 0u64;
        for f in flags {
            assert_eq!(f.count_ones(), 1);
            assert_eq!(seen & f, 0);
            seen |= f;
        }
    }

    #[test]
    fn sandbox_parsing() {
        assert_eq!(sandbox_to_flags("none"), Some(0));
        assert_eq!(sandbox_to_flags("setuid"), Some(FLAG_SANDBOX_SETUID));
        assert_eq!(sandbox_to_flags("namespace"), Some(FLAG_SANDBOX_NAMESPACE));
        assert_eq!(sandbox_to_flags("android"), None);
    }
}
