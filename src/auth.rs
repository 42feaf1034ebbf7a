//! Implementation of auth methods
use sha1_smol::Sha1;

/// Compute the mysql_native_password auth token from the password and the
/// 20 byte scramble sent in the greeting
///
/// SHA1( password ) ^ SHA1( scramble + SHA1( SHA1( password ) ) )
/// <https://mariadb.com/kb/en/connection/#mysql_native_password-plugin>
///
/// An empty password yields an empty token. The password is hashed as raw
/// bytes, the server never sees it as text.
pub fn token(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut ctx = Sha1::new();

    ctx.update(password.as_bytes());
    let mut pw_hash = ctx.digest().bytes();

    ctx.reset();
    ctx.update(&pw_hash);
    let pw_hash_hash = ctx.digest().bytes();

    ctx.reset();
    ctx.update(scramble);
    ctx.update(&pw_hash_hash);
    let pw_seed_hash_hash = ctx.digest().bytes();

    for i in 0..pw_hash.len() {
        pw_hash[i] ^= pw_seed_hash_hash[i];
    }

    pw_hash.to_vec()
}

/// Hash used by the pre-4.1 password protocol
///
/// Space and tab bytes are skipped, the two accumulators wrap at 32 bits and
/// the top bit of both result words is cleared. The exact bit pattern matters,
/// old servers compute the same hash on their side.
fn hash_password(bytes: &[u8]) -> [u32; 2] {
    let mut nr: u32 = 1345345333;
    let mut add: u32 = 7;
    let mut nr2: u32 = 0x12345671;
    for &b in bytes {
        if b == b' ' || b == b'\t' {
            continue;
        }
        let b = u32::from(b);
        nr ^= (nr & 63)
            .wrapping_add(add)
            .wrapping_mul(b)
            .wrapping_add(nr << 8);
        nr2 = nr2.wrapping_add((nr2 << 8) ^ nr);
        add = add.wrapping_add(b);
    }
    [nr & 0x7FFFFFFF, nr2 & 0x7FFFFFFF]
}

/// The linear-congruential generator seeded from the two password hashes
struct Rand323 {
    /// First generator state word, always below [Self::MAX]
    seed1: u32,
    /// Second generator state word, always below [Self::MAX]
    seed2: u32,
}

impl Rand323 {
    /// Modulus of both generator words
    const MAX: u32 = 0x3FFFFFFF;

    /// Seed the generator by XOR-ing the password and message hash words
    fn new(pw: [u32; 2], msg: [u32; 2]) -> Self {
        Rand323 {
            seed1: (pw[0] ^ msg[0]) % Self::MAX,
            seed2: (pw[1] ^ msg[1]) % Self::MAX,
        }
    }

    /// Draw the next pseudo-random value in [0, 1)
    fn next(&mut self) -> f64 {
        self.seed1 = ((u64::from(self.seed1) * 3 + u64::from(self.seed2)) % u64::from(Self::MAX))
            as u32;
        self.seed2 =
            ((u64::from(self.seed1) + u64::from(self.seed2) + 33) % u64::from(Self::MAX)) as u32;
        f64::from(self.seed1) / f64::from(Self::MAX)
    }
}

/// Compute the 8 byte response of the pre-4.1 password protocol
///
/// `message` is the scramble from the greeting, only its first 8 bytes enter
/// the hash. An empty password yields an empty response.
pub fn scramble323(message: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let pw = hash_password(password.as_bytes());
    let msg = hash_password(&message[..8.min(message.len())]);

    let mut rand = Rand323::new(pw, msg);
    let mut out = [0u8; 8];
    for b in &mut out {
        *b = (rand.next() * 31.0).floor() as u8 + 64;
    }
    let mask = (rand.next() * 31.0).floor() as u8;
    for b in &mut out {
        *b ^= mask;
    }
    out.to_vec()
}
