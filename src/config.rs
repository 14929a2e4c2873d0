use std::time::Duration;
use anyhow::bail;

/// The largest message (request or reply) the Homa kernel transport accepts
pub const MAX_MESSAGE_LENGTH: usize = 1_000_000;

pub const BPAGE_SHIFT: u32 = 16;

/// Size of a single page in the receive buffer pool ('bpage'). Incoming messages are placed
///  into the pool in units of this size, and page offsets handed to the application are
///  multiples of it (except for a message's tail fragment).
pub const BPAGE_SIZE: usize = 1 << BPAGE_SHIFT;

/// The maximum number of pool pages a single message can occupy. This determines the size of
///  the page offset array in the receive control block.
///
/// NB: This is integer division, matching the kernel's definition - the 120 byte layout of
///      the receive control block depends on this being 16
pub const MAX_BPAGES: usize = (MAX_MESSAGE_LENGTH + BPAGE_SIZE) / BPAGE_SIZE;

/// IP protocol number of Homa
pub const IPPROTO_HOMA: i32 = 0xFD;

/// Socket option (level [IPPROTO_HOMA]) for registering the receive buffer region
pub const SO_HOMA_SET_BUF: i32 = 10;


#[derive(Debug, Clone)]
pub struct HomaConfig {
    /// Number of pool pages in the receive buffer region that is registered with the socket.
    ///
    /// Every page handed to the application by a receive stays unavailable to the kernel until
    ///  the application recycles it. If the application holds on to pages for a long time or
    ///  has many messages in flight, the region must be big enough to accommodate all of them,
    ///  otherwise receives start failing with 'resource exhausted'.
    pub region_pages: usize,

    /// If set, synchronous send / receive calls return [crate::error::HomaError::WouldBlock]
    ///  instead of waiting for the socket to become ready.
    pub non_blocking: bool,

    /// Upper bound for a single readiness wait in blocking calls. Waits that time out are
    ///  simply repeated, so this does *not* limit the total duration of a blocking call - it
    ///  only bounds the time between two attempts.
    pub poll_timeout: Option<Duration>,
}

impl HomaConfig {
    pub fn default_config() -> HomaConfig {
        HomaConfig {
            region_pages: 1000,
            non_blocking: false,
            poll_timeout: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.region_pages < MAX_BPAGES {
            bail!("receive buffer region must have at least {} pages to hold a message of maximum size, was {}", MAX_BPAGES, self.region_pages);
        }
        if self.region_pages > u32::MAX as usize / BPAGE_SIZE {
            bail!("receive buffer region of {} pages exceeds the range of 32 bit page offsets", self.region_pages);
        }
        if self.poll_timeout == Some(Duration::ZERO) {
            bail!("poll timeout must not be zero");
        }

        Ok(())
    }

    pub fn region_len(&self) -> usize {
        self.region_pages * BPAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_max_bpages() {
        assert_eq!(MAX_BPAGES, 16);
        assert!(MAX_BPAGES * BPAGE_SIZE >= MAX_MESSAGE_LENGTH);
    }

    #[rstest]
    #[case::default(1000, None, true)]
    #[case::minimal(MAX_BPAGES, None, true)]
    #[case::too_small(MAX_BPAGES - 1, None, false)]
    #[case::too_big(100_000, None, false)]
    #[case::zero_timeout(1000, Some(Duration::ZERO), false)]
    #[case::with_timeout(1000, Some(Duration::from_millis(5)), true)]
    fn test_validate(#[case] region_pages: usize, #[case] poll_timeout: Option<Duration>, #[case] expected_valid: bool) {
        let config = HomaConfig {
            region_pages,
            poll_timeout,
            ..HomaConfig::default_config()
        };
        assert_eq!(config.validate().is_ok(), expected_valid);
    }
}
