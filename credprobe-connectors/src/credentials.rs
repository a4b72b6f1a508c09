//! Candidate credential derivation and the first-success attempt loop shared
//! by every credential-aware adapter.

use credprobe_types::{Credential, Target};

/// Hard cap on attempts per probe, whatever the defaults list says.
const MAX_CANDIDATES: usize = 8;

/// Derive the ordered candidate list for a target.
///
/// - Both username and password supplied: exactly that pair, no fallback.
/// - Username only: that user with a blank password first, then the protocol
///   default list.
/// - Neither: the protocol's default list as given.
///
/// Duplicates (same pair from different sources) are dropped, first
/// occurrence wins.
pub fn candidates(target: &Target, defaults: &[(&str, &str)]) -> Vec<Credential> {
    let mut out: Vec<Credential> = Vec::new();

    match (&target.username, &target.password) {
        (Some(user), Some(pass)) => {
            out.push(Credential::new(user, pass, "supplied"));
        }
        (Some(user), None) => {
            out.push(Credential::new(user, "", "blank password"));
            for (du, dp) in defaults {
                out.push(Credential::new(*du, *dp, "default"));
            }
        }
        _ => {
            for (du, dp) in defaults {
                out.push(Credential::new(*du, *dp, "default"));
            }
        }
    }

    let mut seen: Vec<(String, String)> = Vec::new();
    out.retain(|c| {
        if seen.iter().any(|(u, p)| (u.as_str(), p.as_str()) == c.key()) {
            false
        } else {
            seen.push((c.username.clone(), c.password.clone()));
            true
        }
    });
    out.truncate(MAX_CANDIDATES);
    out
}

pub mod prober {
    use std::future::Future;

    use credprobe_types::Credential;

    use crate::{ConnectorError, ProbeContext};

    /// Try candidates in order, stopping at the first success. On exhaustion
    /// the last attempt's error is returned.
    pub async fn run<T, F, Fut>(
        cx: &ProbeContext,
        candidates: Vec<Credential>,
        mut attempt: F,
    ) -> Result<(Credential, T), ConnectorError>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let mut last_err = ConnectorError::AuthFailed("no credentials to try".to_string());
        for cred in candidates {
            let who = if cred.is_anonymous() {
                "<anonymous>".to_string()
            } else if cred.password.is_empty() {
                format!("{} (empty password)", cred.username)
            } else {
                cred.username.clone()
            };
            cx.log(format!("trying {} [{}]", who, cred.label));
            match attempt(cred.clone()).await {
                Ok(value) => return Ok((cred, value)),
                Err(e) => {
                    cx.log(format!("attempt failed: {e}"));
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credprobe_types::Protocol;

    const DEFAULTS: &[(&str, &str)] = &[("root", ""), ("admin", "admin"), ("root", "root")];

    fn target(user: Option<&str>, pass: Option<&str>) -> Target {
        Target::new(Protocol::MySql, "10.0.0.1", 3306)
            .with_credentials(user.map(String::from), pass.map(String::from))
    }

    #[test]
    fn both_supplied_means_exactly_one_attempt() {
        let c = candidates(&target(Some("dba"), Some("hunter2")), DEFAULTS);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].username, "dba");
        assert_eq!(c[0].password, "hunter2");
    }

    #[test]
    fn user_only_tries_blank_then_the_default_list() {
        let c = candidates(&target(Some("root"), None), DEFAULTS);
        let pairs: Vec<_> = c.iter().map(Credential::key).collect();
        assert_eq!(
            pairs,
            vec![("root", ""), ("admin", "admin"), ("root", "root")]
        );
    }

    #[test]
    fn user_only_keeps_defaults_for_other_usernames() {
        let c = candidates(&target(Some("dba"), None), &[("root", "")]);
        let pairs: Vec<_> = c.iter().map(Credential::key).collect();
        assert_eq!(pairs, vec![("dba", ""), ("root", "")]);
    }

    #[test]
    fn no_credentials_walks_the_default_list() {
        let c = candidates(&target(None, None), DEFAULTS);
        assert_eq!(c.len(), 3);
        assert_eq!(c[0].username, "root");
        assert_eq!(c[1].username, "admin");
    }

    #[test]
    fn duplicates_are_dropped_first_wins() {
        let c = candidates(
            &target(None, None),
            &[("guest", "guest"), ("guest", "guest"), ("guest", "")],
        );
        assert_eq!(c.len(), 2);
    }

    #[tokio::test]
    async fn prober_stops_at_first_success() {
        let cx = crate::ProbeContext::new(None);
        let list = candidates(&target(None, None), DEFAULTS);
        let mut attempts = 0u32;
        let result = prober::run(&cx, list, |cred| {
            attempts += 1;
            async move {
                if cred.username == "admin" {
                    Ok("in")
                } else {
                    Err(crate::ConnectorError::AuthFailed("denied".into()))
                }
            }
        })
        .await;
        let (cred, value) = result.unwrap();
        assert_eq!(cred.username, "admin");
        assert_eq!(value, "in");
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn prober_returns_last_error_on_exhaustion() {
        let cx = crate::ProbeContext::new(None);
        let list = candidates(&target(None, None), &[("a", "a"), ("b", "b")]);
        let result: Result<(Credential, ()), _> = prober::run(&cx, list, |cred| async move {
            Err(crate::ConnectorError::AuthFailed(format!("no {}", cred.username)))
        })
        .await;
        match result {
            Err(crate::ConnectorError::AuthFailed(msg)) => assert_eq!(msg, "no b"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
