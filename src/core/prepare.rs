//! ST-016: Host preparation.
//!
//! Cache bookkeeping runs as the login user, so the cache root must be a
//! setgid directory owned by a group the user belongs to. Checked once per
//! host per run; fixed with one elevated script when the group is missing.

use super::error::ProvisionError;
use super::types::Settings;
use crate::commands::quote;
use crate::transport::{capture, Target};

/// Whether `id -nG` output lists `group`.
pub fn has_group(id_output: &str, group: &str) -> bool {
    id_output.split_whitespace().any(|g| g == group)
}

/// Shell that creates the cache group and root and adds `user` to the group.
pub fn setup_script(settings: &Settings, user: &str) -> String {
    let group = quote(&settings.cache_group);
    let root = quote(&settings.cache_root);
    let user = quote(user);
    format!(
        "getent group {group} >/dev/null || groupadd {group}; \
         mkdir -p {root}; chgrp {group} {root}; chmod 2775 {root}; \
         usermod -a -G {group} {user}"
    )
}

/// Make sure the login user can write the cache. Returns true when the host
/// had to be set up.
pub fn prepare_host(target: &dyn Target, settings: &Settings) -> Result<bool, ProvisionError> {
    let ids = capture(target, "id -nG")?;
    if !ids.success() {
        return Err(ProvisionError::HostPrep {
            exit_code: ids.exit_code,
            stderr: ids.stderr.trim().to_string(),
        });
    }
    if has_group(&ids.stdout, &settings.cache_group) {
        return Ok(false);
    }

    log::info!(
        "{}: creating cache group '{}' for {}",
        target.address(),
        settings.cache_group,
        target.user()
    );
    let script = format!("bash -e -c {}", quote(&setup_script(settings, target.user())));
    let script = if settings.elevation.applies(target.user()) {
        format!("sudo -n -H {script}")
    } else {
        script
    };
    let out = capture(target, &script)?;
    if !out.success() {
        return Err(ProvisionError::HostPrep {
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    // new group membership only shows up in a fresh login session
    target.reset()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Elevation;
    use crate::transport::LocalTarget;

    #[test]
    fn test_st016_has_group() {
        assert!(has_group("deploy sudo strata\n", "strata"));
        assert!(!has_group("deploy strata-old\n", "strata"));
        assert!(!has_group("", "strata"));
    }

    #[test]
    fn test_st016_setup_script() {
        let settings = Settings::default();
        let script = setup_script(&settings, "deploy");
        assert_eq!(
            script,
            "getent group strata >/dev/null || groupadd strata; \
             mkdir -p /var/lib/strata; chgrp strata /var/lib/strata; \
             chmod 2775 /var/lib/strata; usermod -a -G strata deploy"
        );
    }

    #[test]
    fn test_st016_present_group_is_noop() {
        let target = LocalTarget::new();
        let ids = capture(&target, "id -gn").unwrap();
        let settings = Settings {
            cache_group: ids.stdout.trim().to_string(),
            elevation: Elevation::Never,
            ..Settings::default()
        };
        assert!(!prepare_host(&target, &settings).unwrap());
    }
}
