//! Translation of opaque IKE proposal strings into native parameters
//!
//! Native IPsec tooling takes discrete cipher/hash/group names rather than a
//! strongSwan-style proposal such as `aes256-sha256-modp2048`. Each table is
//! scanned in order and every entry whose token occurs in the proposal
//! overrides the previous pick, so the last matching entry wins.

use serde::Serialize;

const ENCRYPTION_TOKENS: &[(&str, &str)] = &[("aes256", "AES256"), ("aes128", "AES128"), ("3des", "DES3")];
const HASH_TOKENS: &[(&str, &str)] = &[("sha256", "SHA256"), ("sha1", "SHA1"), ("sha384", "SHA384")];
const DH_TOKENS: &[(&str, &str)] = &[("dh14", "DH14"), ("dh2", "DH2"), ("modp2048", "DH14")];

pub const FALLBACK_ENCRYPTION: &str = "AES256";
pub const FALLBACK_HASH: &str = "SHA256";
pub const FALLBACK_DH_GROUP: &str = "DH14";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NativeCrypto {
    pub encryption: &'static str,
    pub hash: &'static str,
    pub dh_group: &'static str,
}

impl Default for NativeCrypto {
    fn default() -> Self {
        Self {
            encryption: FALLBACK_ENCRYPTION,
            hash: FALLBACK_HASH,
            dh_group: FALLBACK_DH_GROUP,
        }
    }
}

impl NativeCrypto {
    /// Map an IKE proposal. Unrecognized parts keep the fallback value.
    pub fn from_proposal(proposal: &str) -> Self {
        let proposal = proposal.to_ascii_lowercase();
        let fallback = Self::default();
        Self {
            encryption: last_match(&proposal, ENCRYPTION_TOKENS).unwrap_or(fallback.encryption),
            hash: last_match(&proposal, HASH_TOKENS).unwrap_or(fallback.hash),
            dh_group: last_match(&proposal, DH_TOKENS).unwrap_or(fallback.dh_group),
        }
    }
}

fn last_match(proposal: &str, table: &[(&str, &'static str)]) -> Option<&'static str> {
    table
        .iter()
        .filter(|(token, _)| proposal.contains(token))
        .map(|(_, native)| *native)
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_a_full_proposal() {
        let native = NativeCrypto::from_proposal("aes256-sha256-dh14");
        assert_eq!(
            native,
            NativeCrypto {
                encryption: "AES256",
                hash: "SHA256",
                dh_group: "DH14"
            }
        );
    }

    #[test]
    fn modp_names_map_to_groups() {
        let native = NativeCrypto::from_proposal("AES128-SHA1-MODP2048");
        assert_eq!(native.encryption, "AES128");
        assert_eq!(native.hash, "SHA1");
        assert_eq!(native.dh_group, "DH14");
    }

    #[test]
    fn unrecognized_proposal_uses_fallback() {
        assert_eq!(NativeCrypto::from_proposal("default"), NativeCrypto::default());
        assert_eq!(NativeCrypto::from_proposal(""), NativeCrypto::default());
    }

    #[test]
    fn later_table_entries_win() {
        // "aes128" comes after "aes256" in the table, whatever the order in the string.
        let native = NativeCrypto::from_proposal("aes128-aes256-sha384-sha1");
        assert_eq!(native.encryption, "AES128");
        assert_eq!(native.hash, "SHA384");

        let native = NativeCrypto::from_proposal("3des-dh2-modp2048");
        assert_eq!(native.encryption, "DES3");
        assert_eq!(native.dh_group, "DH14");
    }
}
