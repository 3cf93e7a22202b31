//! Port probing and window allocation.

/// Width of the probe window above a desired port.
pub const PROBE_WINDOW: u16 = 100;

/// View of a port pool's availability. Implemented by a live bind probe on
/// the client, by listening-set inspection on a substrate, and by a scripted
/// set in tests.
pub trait PortProbe {
    fn is_free(&self, port: u16) -> bool;
}

impl<F> PortProbe for F
where
    F: Fn(u16) -> bool,
{
    fn is_free(&self, port: u16) -> bool {
        self(port)
    }
}

/// The desired port and the 99 above it are all taken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no free port in [{desired}, {desired}+{window})")]
pub struct PortExhaustedError {
    pub desired: u16,
    pub window: u16,
}

/// Return `desired` if free, otherwise the first free port above it within
/// the probe window.
pub fn alloc_port(probe: &dyn PortProbe, desired: u16) -> Result<u16, PortExhaustedError> {
    for offset in 0..PROBE_WINDOW {
        let candidate = match desired.checked_add(offset) {
            Some(p) => p,
            None => break,
        };
        if probe.is_free(candidate) {
            return Ok(candidate);
        }
    }
    Err(PortExhaustedError {
        desired,
        window: PROBE_WINDOW,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Taken(HashSet<u16>);

    impl PortProbe for Taken {
        fn is_free(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    #[test]
    fn free_port_is_returned_unchanged() {
        let probe = Taken(HashSet::new());
        assert_eq!(alloc_port(&probe, 3000).unwrap(), 3000);
    }

    #[test]
    fn collision_advances_by_one() {
        let probe = Taken([3000].into_iter().collect());
        assert_eq!(alloc_port(&probe, 3000).unwrap(), 3001);
    }

    #[test]
    fn window_exhaustion_errors() {
        let taken: HashSet<u16> = (3000..3100).collect();
        let probe = Taken(taken);
        let err = alloc_port(&probe, 3000).unwrap_err();
        assert_eq!(err.desired, 3000);
    }

    #[test]
    fn window_does_not_wrap_past_u16_max() {
        let taken: HashSet<u16> = (65500..=u16::MAX).collect();
        let probe = Taken(taken);
        assert!(alloc_port(&probe, 65500).is_err());
    }
}
