//! CDN-ownership routing.

/// Where protocol traffic for a task is coordinated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdnRoute {
    Local,
    /// Another supernode owns the task's origin fetch. Carries its PID.
    Remote(String),
}

impl CdnRoute {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

/// Route a task by its CDN owner. Always local when HA is off.
pub fn route(ha_enabled: bool, owner_pid: &str, local_pid: &str) -> CdnRoute {
    if !ha_enabled || owner_pid == local_pid {
        CdnRoute::Local
    } else {
        CdnRoute::Remote(owner_pid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ha_disabled_is_always_local() {
        assert_eq!(route(false, "other", "me"), CdnRoute::Local);
    }

    #[test]
    fn owner_decides_when_ha_enabled() {
        assert_eq!(route(true, "me", "me"), CdnRoute::Local);
        assert_eq!(route(true, "p1", "me"), CdnRoute::Remote("p1".into()));
        assert!(!route(true, "p1", "me").is_local());
    }
}
