//! Staker metadata: a closed key whitelist with per-key signing authority,
//! and a restricted value character set.

pub const QP_MAX_META_KEY_LENGTH: usize = 16;
pub const QP_MAX_META_VALUE_LENGTH: usize = 40;

/// Which role keys may sign a given operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAuthority(pub u8);

impl KeyAuthority {
    pub const NONE: KeyAuthority = KeyAuthority(0);
    pub const OWNER: KeyAuthority = KeyAuthority(1);
    pub const DELEGATE: KeyAuthority = KeyAuthority(1 << 1);
    pub const CONTROLLER: KeyAuthority = KeyAuthority(1 << 2);
    pub const MANAGER: KeyAuthority = KeyAuthority(1 << 3);
    /// owner | manager
    pub const OM: KeyAuthority = KeyAuthority(1 | 1 << 3);
    /// owner | manager | delegate
    pub const OMD: KeyAuthority = KeyAuthority(1 | 1 << 1 | 1 << 3);
    /// owner | manager | controller
    pub const OMC: KeyAuthority = KeyAuthority(1 | 1 << 2 | 1 << 3);

    pub fn permits(&self, role: KeyAuthority) -> bool {
        self.0 & role.0 != 0
    }
}

/// Meta keys are a consensus whitelist; the authority class says who may set
/// each one.
pub fn check_meta_key(key: &str) -> KeyAuthority {
    match key {
        "certified_node" => KeyAuthority::OMD,
        _ => KeyAuthority::NONE,
    }
}

pub fn check_meta_value(value: &str) -> bool {
    if value.len() > QP_MAX_META_VALUE_LENGTH {
        return false;
    }
    value.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'.' | b'_' | b':' | b' ' | b'<' | b'>' | b'/' | b'@' | b'#' | b',' | b'+' | b'-'
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_and_authority() {
        let auth = check_meta_key("certified_node");
        assert!(auth.permits(KeyAuthority::OWNER));
        assert!(auth.permits(KeyAuthority::DELEGATE));
        assert!(auth.permits(KeyAuthority::MANAGER));
        assert!(!auth.permits(KeyAuthority::CONTROLLER));
        assert_eq!(check_meta_key("favorite_color"), KeyAuthority::NONE);
    }

    #[test]
    fn value_charset() {
        assert!(check_meta_value("node.example.com:4111"));
        assert!(check_meta_value("1.2.3.4"));
        assert!(!check_meta_value("no\ttabs"));
        assert!(!check_meta_value(&"x".repeat(41)));
    }
}
