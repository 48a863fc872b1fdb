//! Command-line token policy shared by `parent` and the root task's module
//! loader (spec.md §6). Tokens are whitespace-separated words on a client's
//! module command line; every lookup here is a verbatim port of
//! `s0_ParentProtocol::ClientData::{Cmdline, get_quota}` and
//! `check_permission` from the original sigma0 parent protocol.

/// Borrowed view over a module's command-line bytes. Never owns the
/// backing storage: a `Module`'s `cmdline` field outlives every `Cmdline`
/// built over it (spec.md §3's `Module` data model).
#[derive(Debug, Clone, Copy)]
pub struct Cmdline<'a> {
    raw: &'a str,
}

impl<'a> Cmdline<'a> {
    pub fn new(raw: &'a str) -> Self {
        Cmdline { raw }
    }

    fn tokens(&self) -> impl Iterator<Item = &'a str> {
        self.raw.split_whitespace()
    }

    /// True iff some token is exactly `word`.
    pub fn has(&self, word: &str) -> bool {
        self.tokens().any(|t| t == word)
    }

    /// The tail of the first token starting with `prefix`, if any.
    pub fn get(&self, prefix: &str) -> Option<&'a str> {
        self.tokens().find_map(|t| t.strip_prefix(prefix))
    }

    /// `namespace::<path>` — prefix prepended to every name this client
    /// REGISTERs (spec.md §6).
    pub fn namespace(&self) -> Option<&'a str> {
        self.get("namespace::")
    }

    /// `sigma0::cpu=<n>` — pin the client to CPU n.
    pub fn cpu_pin(&self) -> Option<u32> {
        self.get("sigma0::cpu=").and_then(|s| s.parse().ok())
    }

    /// `sigma0::dma` — client may enable DMA (IOMMU assignment).
    pub fn dma_allowed(&self) -> bool {
        self.has("sigma0::dma")
    }

    /// `sigma0::mem:<MiB>` — memory budget override.
    pub fn mem_budget_mib(&self) -> Option<u32> {
        self.get("sigma0::mem:").and_then(|s| s.parse().ok())
    }

    /// Whether this client's command line grants OPEN access to a service
    /// named `name`, skipping the first `instance` prior matches.
    ///
    /// Ported from `check_permission`: a `name::<namespace>/<tail>` token
    /// counts only if its suffix is exactly `name` and the byte immediately
    /// preceding that suffix is `/` (the namespace separator).
    pub fn permits(&self, name: &str, instance: u32) -> bool {
        self.matching_full_name(name, instance).is_some()
    }

    /// Like [`Cmdline::permits`], but returns the full `name::<namespace>/<tail>`
    /// token's value (the full service name OPEN should resolve against,
    /// e.g. `/s0/timer`) instead of a bare yes/no. GET_PORTAL later matches
    /// a registered service's full name against exactly this string.
    pub fn matching_full_name(&self, name: &str, instance: u32) -> Option<&'a str> {
        let mut skip = instance;
        for tok in self.tokens().filter_map(|t| t.strip_prefix("name::")) {
            if tok.len() > name.len()
                && tok.ends_with(name)
                && tok.as_bytes()[tok.len() - name.len() - 1] == b'/'
            {
                if skip == 0 {
                    return Some(tok);
                }
                skip -= 1;
            }
        }
        None
    }

    /// `quota::guid` — client may learn its numeric id through GET_QUOTA.
    pub fn guid_allowed(&self) -> bool {
        self.has("quota::guid")
    }

    /// Disk-resource grant check for GET_QUOTA's `disk::<name>` request,
    /// including the `sigma0::drive:<idx>` single-digit back-compat form
    /// (`ClientData::get_quota`'s `disk::` branch).
    pub fn disk_allowed(&self, disk_name: &str) -> bool {
        if self.has(&format!("disk::{disk_name}")) {
            return true;
        }
        if disk_name.len() == 1 && disk_name.as_bytes()[0].is_ascii_digit() {
            return self.has(&format!("sigma0::drive:{disk_name}"));
        }
        false
    }

    /// `diskadd` — general disk-resource grant.
    pub fn diskadd_allowed(&self) -> bool {
        self.has("diskadd")
    }
}

/// Outcome of a GET_QUOTA policy lookup (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Denied,
}

/// `ClientData::get_quota`'s resource-name dispatch: `mem`/`cap` are
/// accepted unconditionally, `guid`/`disk::<name>`/`diskadd` are gated on
/// the tokens above.
pub fn get_quota(cmdline: &Cmdline, resource_name: &str) -> QuotaDecision {
    use QuotaDecision::*;
    match resource_name {
        "mem" | "cap" => Allowed,
        "guid" => {
            if cmdline.guid_allowed() {
                Allowed
            } else {
                Denied
            }
        }
        name if name.starts_with("disk::") => {
            if cmdline.disk_allowed(&name[6..]) {
                Allowed
            } else {
                Denied
            }
        }
        "diskadd" => {
            if cmdline.diskadd_allowed() {
                Allowed
            } else {
                Denied
            }
        }
        _ => Denied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_matches_namespaced_suffix() {
        let c = Cmdline::new("name::/s0/timer quota::guid");
        assert!(c.permits("timer", 0));
        assert!(!c.permits("disk", 0));
    }

    #[test]
    fn matching_full_name_returns_the_whole_namespaced_token() {
        let c = Cmdline::new("name::/s0/timer");
        assert_eq!(c.matching_full_name("timer", 0), Some("/s0/timer"));
        assert_eq!(c.matching_full_name("disk", 0), None);
    }

    #[test]
    fn permits_requires_namespace_separator_before_suffix() {
        // "nottimer" ends with "timer" but the preceding byte isn't '/'.
        let c = Cmdline::new("name::/s0/nottimer");
        assert!(!c.permits("timer", 0));
    }

    #[test]
    fn permits_skips_prior_instances() {
        let c = Cmdline::new("name::/s0/timer name::/s1/timer");
        assert!(c.permits("timer", 0));
        assert!(c.permits("timer", 1));
        assert!(!c.permits("timer", 2));
    }

    #[test]
    fn namespace_and_cpu_pin_tokens() {
        let c = Cmdline::new("namespace::/s0 sigma0::cpu=2 sigma0::dma");
        assert_eq!(c.namespace(), Some("/s0"));
        assert_eq!(c.cpu_pin(), Some(2));
        assert!(c.dma_allowed());
    }

    #[test]
    fn quota_mem_and_cap_are_unconditional() {
        let c = Cmdline::new("");
        assert_eq!(get_quota(&c, "mem"), QuotaDecision::Allowed);
        assert_eq!(get_quota(&c, "cap"), QuotaDecision::Allowed);
    }

    #[test]
    fn quota_guid_gated_on_token() {
        let granted = Cmdline::new("quota::guid");
        let denied = Cmdline::new("");
        assert_eq!(get_quota(&granted, "guid"), QuotaDecision::Allowed);
        assert_eq!(get_quota(&denied, "guid"), QuotaDecision::Denied);
    }

    #[test]
    fn quota_disk_backcompat_single_digit_drive() {
        let c = Cmdline::new("sigma0::drive:3");
        assert_eq!(get_quota(&c, "disk::3"), QuotaDecision::Allowed);
        assert_eq!(get_quota(&c, "disk::4"), QuotaDecision::Denied);
    }

    #[test]
    fn quota_diskadd_and_unknown_resource() {
        let c = Cmdline::new("diskadd");
        assert_eq!(get_quota(&c, "diskadd"), QuotaDecision::Allowed);
        assert_eq!(get_quota(&c, "bogus"), QuotaDecision::Denied);
    }
}
