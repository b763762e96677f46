//! Stripe-to-PG selection.
//!
//! PG selection hashes the decimal string of the stripe id with the
//! rjenkins 32-bit string hash (the Ceph `str_hash_rjenkins` form) modulo
//! the PG count. The hash must stay bit-exact: changing it remaps every
//! stripe and breaks data placed by earlier versions.

use stripeio_common::{PgId, StripeId};

fn mix(mut a: u32, mut b: u32, mut c: u32) -> (u32, u32, u32) {
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 13);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 8);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 13);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 12);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 16);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 5);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 3);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 10);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 15);
    (a, b, c)
}

/// rjenkins 32-bit string hash.
#[must_use]
pub fn rjenkins_hash(key: &[u8]) -> u32 {
    let mut a: u32 = 0x9e37_79b9;
    let mut b: u32 = a;
    let mut c: u32 = 0;
    let length = key.len() as u32;

    let mut k = key;
    while k.len() >= 12 {
        a = a.wrapping_add(
            u32::from(k[0])
                | (u32::from(k[1]) << 8)
                | (u32::from(k[2]) << 16)
                | (u32::from(k[3]) << 24),
        );
        b = b.wrapping_add(
            u32::from(k[4])
                | (u32::from(k[5]) << 8)
                | (u32::from(k[6]) << 16)
                | (u32::from(k[7]) << 24),
        );
        c = c.wrapping_add(
            u32::from(k[8])
                | (u32::from(k[9]) << 8)
                | (u32::from(k[10]) << 16)
                | (u32::from(k[11]) << 24),
        );
        (a, b, c) = mix(a, b, c);
        k = &k[12..];
    }

    c = c.wrapping_add(length);
    if k.len() >= 11 {
        c = c.wrapping_add(u32::from(k[10]) << 24);
    }
    if k.len() >= 10 {
        c = c.wrapping_add(u32::from(k[9]) << 16);
    }
    if k.len() >= 9 {
        c = c.wrapping_add(u32::from(k[8]) << 8);
    }
    // The low byte of c is reserved for the length.
    if k.len() >= 8 {
        b = b.wrapping_add(u32::from(k[7]) << 24);
    }
    if k.len() >= 7 {
        b = b.wrapping_add(u32::from(k[6]) << 16);
    }
    if k.len() >= 6 {
        b = b.wrapping_add(u32::from(k[5]) << 8);
    }
    if k.len() >= 5 {
        b = b.wrapping_add(u32::from(k[4]));
    }
    if k.len() >= 4 {
        a = a.wrapping_add(u32::from(k[3]) << 24);
    }
    if k.len() >= 3 {
        a = a.wrapping_add(u32::from(k[2]) << 16);
    }
    if k.len() >= 2 {
        a = a.wrapping_add(u32::from(k[1]) << 8);
    }
    if !k.is_empty() {
        a = a.wrapping_add(u32::from(k[0]));
    }
    (_, _, c) = mix(a, b, c);
    c
}

/// PG for a stripe: `rjenkins(decimal(stripe_id)) mod pg_num`.
#[must_use]
pub fn select_pg(stripe_id: StripeId, pg_num: usize) -> PgId {
    let s = stripe_id.to_string();
    rjenkins_hash(s.as_bytes()) % pg_num as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(rjenkins_hash(b"0"), rjenkins_hash(b"0"));
        assert_eq!(rjenkins_hash(b"1234567890123"), rjenkins_hash(b"1234567890123"));
    }

    #[test]
    fn hash_separates_nearby_keys() {
        // Not a collision proof, but placement would be useless if decimal
        // neighbors collapsed onto one value.
        let h: Vec<u32> = (0_u64..16).map(|i| rjenkins_hash(i.to_string().as_bytes())).collect();
        let distinct: std::collections::BTreeSet<_> = h.iter().collect();
        assert!(distinct.len() > 12);
    }

    #[test]
    fn select_pg_is_modular() {
        for id in 0_u64..64 {
            let pg = select_pg(id, 16);
            assert!(pg < 16);
            assert_eq!(pg, rjenkins_hash(id.to_string().as_bytes()) % 16);
        }
    }

    #[test]
    fn long_keys_take_the_block_path() {
        // 13 bytes exercises one 12-byte block plus the tail switch.
        let h1 = rjenkins_hash(b"abcdefghijklm");
        let h2 = rjenkins_hash(b"abcdefghijkln");
        assert_ne!(h1, h2);
    }
}
