/// Adler32-style rolling hash for block matching.
///
/// Two 16-bit sums (a, b) combined into a 32-bit digest. Sliding the window by
/// one byte is O(1): drop the oldest byte, take in the next one.
const MOD_ADLER: u64 = 65521;

#[derive(Debug, Clone, Copy)]
pub struct RollingHash {
    a: u64,
    b: u64,
    window_size: u64,
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingHash {
    pub fn new() -> Self {
        Self {
            a: 1,
            b: 0,
            window_size: 0,
        }
    }

    /// Hash of `data` taken as a whole window.
    pub fn of(data: &[u8]) -> u32 {
        let mut hash = Self::new();
        hash.init(data);
        hash.digest()
    }

    /// Reset the window to `data`.
    pub fn init(&mut self, data: &[u8]) {
        self.window_size = data.len() as u64;
        // Reduce once per 4 KiB instead of per byte; `b` stays far below u64::MAX.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for chunk in data.chunks(4096) {
            for &byte in chunk {
                a += u64::from(byte);
                b += a;
            }
            a %= MOD_ADLER;
            b %= MOD_ADLER;
        }
        self.a = a;
        self.b = b;
    }

    /// Slide the window: `old_byte` leaves at the front, `new_byte` enters at the back.
    pub fn rotate(&mut self, old_byte: u8, new_byte: u8) {
        let old = u64::from(old_byte);
        let new = u64::from(new_byte);

        self.a = (self.a + MOD_ADLER - old + new) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a + MOD_ADLER
            - (old * self.window_size) % MOD_ADLER)
            % MOD_ADLER;
    }

    pub fn digest(&self) -> u32 {
        ((self.b as u32) << 16) | self.a as u32
    }
}
