use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Random generation helpers for lock tokens and permit identifiers
pub struct RngUtils;

impl RngUtils {
    /// Generate a random alphanumeric string of default length (16 characters)
    pub fn random_string() -> String {
        Self::random_string_with_length(16)
    }

    /// Generate a random string of specified length using alphanumeric characters
    pub fn random_string_with_length(length: usize) -> String {
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }

    /// Generate an unguessable lock token: 20 bytes from the thread-local CSPRNG, hex encoded
    pub fn random_token() -> String {
        let bytes: [u8; 20] = thread_rng().gen();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Generate a random fraction in `[low, 1.0]`
    pub fn random_fraction(low: f64) -> f64 {
        let low = low.clamp(0.0, 1.0);
        if low >= 1.0 {
            return 1.0;
        }
        thread_rng().gen_range(low..=1.0)
    }

    /// Generate a random u64 within `[0, max]`
    pub fn random_u64_up_to(max: u64) -> u64 {
        thread_rng().gen_range(0..=max)
    }
}
