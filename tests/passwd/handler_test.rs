//! End-to-end tests driving scripted stand-ins for the passwd program.

use std::path::Path;
use std::sync::{Arc, Mutex};

use passwd_driver::config::BackendConfig;
use passwd_driver::passwd::{PasswdError, PasswdHandler, PasswdResult, PasswdState, RejectionReason};
use tempfile::TempDir;

/// Behaves like passwd for a user whose password is "old-secret".
const PASSWD_SCRIPT: &str = r#"
[ "$LC_ALL" = "C" ] || exit 99
printf 'Changing password for tester.\n'
printf 'Current password: '
read -r current
if [ "$current" != "old-secret" ]; then
    printf 'passwd: Authentication token manipulation error\n' >&2
    printf 'passwd: password unchanged\n' >&2
    exit 1
fi
printf 'New password: '
read -r new
printf 'Retype new password: '
read -r retype
if [ "$new" != "$retype" ]; then
    printf 'Sorry, passwords do not match.\n'
    exit 10
fi
if [ ${#new} -lt 8 ]; then
    printf 'BAD PASSWORD: The password is shorter than 8 characters\n'
    exit 10
fi
printf 'passwd: password updated successfully\n'
exit 0
"#;

/// A user with no password: passwd asks for the new one straight away.
const NO_PASSWORD_SCRIPT: &str = r#"
printf 'Enter new password: '
read -r new
[ "$new" = "fresh-secret" ] || exit 2
printf 'Retype new password: '
read -r retype
[ "$retype" = "fresh-secret" ] || exit 3
printf 'passwd: password updated successfully\n'
"#;

/// A user with no password and a minimum-length policy.
const NO_PASSWORD_POLICY_SCRIPT: &str = r#"
printf 'Enter new password: '
read -r new
printf 'Retype new password: '
read -r retype
if [ "$new" != "$retype" ]; then
    printf 'Sorry, passwords do not match.\n'
    exit 10
fi
if [ ${#new} -lt 8 ]; then
    printf 'BAD PASSWORD: The password is shorter than 8 characters\n'
    exit 10
fi
printf 'passwd: password updated successfully\n'
"#;

/// Exits cleanly after the retype without printing a verdict.
const SILENT_SCRIPT: &str = r#"
printf 'Current password: '
read -r current
printf 'New password: '
read -r new
printf 'Retype new password: '
read -r retype
exit 0
"#;

/// Authenticates, then never answers again.
const HANGING_SCRIPT: &str = r#"
printf 'Current password: '
read -r current
printf 'New password: '
exec sleep 30
"#;

fn fake_passwd(dir: &TempDir, body: &str) -> BackendConfig {
    let path = dir.path().join("passwd.sh");
    std::fs::write(&path, body).unwrap();
    script_config(&path)
}

fn script_config(path: &Path) -> BackendConfig {
    // Run through sh so the script is read, not exec'd, avoiding ETXTBSY races.
    let mut config = BackendConfig::with_program("/bin/sh");
    config.args = vec![path.display().to_string()];
    config
}

fn recorder() -> (Arc<Mutex<Vec<PasswdResult>>>, impl Fn(PasswdResult) + Send + 'static) {
    let calls: Arc<Mutex<Vec<PasswdResult>>> = Arc::default();
    let sink = Arc::clone(&calls);
    (calls, move |result: PasswdResult| sink.lock().unwrap().push(result))
}

#[tokio::test]
async fn authenticate_then_change() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, PASSWD_SCRIPT));

    handler.authenticate_and_wait("old-secret").await.unwrap();
    assert_eq!(handler.state(), PasswdState::AwaitingNew);
    assert!(handler.is_running());

    handler.change_password_and_wait("new-secret-1").await.unwrap();
    assert_eq!(handler.state(), PasswdState::Done);
    assert!(!handler.is_changing_password());

    handler.run_until_idle().await;
    assert!(!handler.is_running());
    assert_eq!(handler.state(), PasswdState::None);
}

#[tokio::test]
async fn wrong_current_password() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, PASSWD_SCRIPT));

    let err = handler.authenticate_and_wait("guess").await.unwrap_err();
    assert!(matches!(err, PasswdError::AuthFailed));
}

#[tokio::test]
async fn change_without_authenticate_reports_auth_failure_to_change_callback() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, PASSWD_SCRIPT));

    let (calls, cb) = recorder();
    assert!(handler.change_password("new-secret-1", cb));
    assert!(handler.is_changing_password());
    handler.run_until_idle().await;

    let calls = calls.lock().unwrap();
    assert!(matches!(calls[..], [Err(PasswdError::AuthFailed)]));
    assert!(!handler.is_changing_password());
}

#[tokio::test]
async fn rejection_then_retry_restarts_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, PASSWD_SCRIPT));

    handler.authenticate_and_wait("old-secret").await.unwrap();
    let err = handler.change_password_and_wait("short").await.unwrap_err();
    assert_eq!(err.rejection(), Some(RejectionReason::TooShort));
    assert_eq!(handler.state(), PasswdState::Error);

    handler.change_password_and_wait("long-enough").await.unwrap();
    assert_eq!(handler.state(), PasswdState::Done);
}

#[tokio::test]
async fn change_after_backend_exit_reauthenticates() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, PASSWD_SCRIPT));

    handler.authenticate_and_wait("old-secret").await.unwrap();
    handler.teardown();
    assert!(!handler.is_running());

    handler.change_password_and_wait("new-secret-1").await.unwrap();
}

#[tokio::test]
async fn user_without_password() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, NO_PASSWORD_SCRIPT));

    handler.authenticate_and_wait("").await.unwrap();
    assert_eq!(handler.state(), PasswdState::AwaitingNew);
    handler.change_password_and_wait("fresh-secret").await.unwrap();
}

#[tokio::test]
async fn user_without_password_retries_after_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, NO_PASSWORD_POLICY_SCRIPT));

    handler.authenticate_and_wait("").await.unwrap();
    let err = handler.change_password_and_wait("short").await.unwrap_err();
    assert_eq!(err.rejection(), Some(RejectionReason::TooShort));
    assert_eq!(handler.state(), PasswdState::Error);

    handler.change_password_and_wait("long-enough").await.unwrap();
    assert_eq!(handler.state(), PasswdState::Done);
}

#[tokio::test]
async fn user_without_password_retries_after_backend_exit() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, NO_PASSWORD_POLICY_SCRIPT));

    handler.authenticate_and_wait("").await.unwrap();
    handler.teardown();

    handler.change_password_and_wait("long-enough").await.unwrap();
}

#[tokio::test]
async fn failed_spawn_drops_auth_callback() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("passwd.sh");
    std::fs::write(&script, PASSWD_SCRIPT).unwrap();
    let shell = dir.path().join("sh");
    let mut config = BackendConfig::with_program(&shell);
    config.args = vec![script.display().to_string()];
    let mut handler = PasswdHandler::new(config);

    let (calls, cb) = recorder();
    let err = handler.authenticate("old-secret", cb).unwrap_err();
    assert!(matches!(err, PasswdError::Backend(_)));

    // The program shows up later; a restarted change authenticates again.
    std::os::unix::fs::symlink("/bin/sh", &shell).unwrap();
    handler.change_password_and_wait("new-secret-1").await.unwrap();

    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn silent_clean_exit_counts_as_success() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, SILENT_SCRIPT));

    handler.authenticate_and_wait("old-secret").await.unwrap();
    handler.change_password_and_wait("new-secret-1").await.unwrap();
    assert!(!handler.is_running());
}

#[tokio::test]
async fn authenticate_is_ignored_during_change() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, HANGING_SCRIPT));

    handler.authenticate_and_wait("old-secret").await.unwrap();
    let pid = handler.pid();
    let (_, cb) = recorder();
    assert!(handler.change_password("new-secret-1", cb));

    let (auth_calls, auth_cb) = recorder();
    handler.authenticate("other", auth_cb).unwrap();
    assert_eq!(handler.pid(), pid);
    assert!(handler.is_changing_password());
    assert!(auth_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_silences_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, PASSWD_SCRIPT));

    let (calls, cb) = recorder();
    handler.authenticate("old-secret", cb).unwrap();
    assert!(handler.is_running());

    handler.cancel();
    handler.cancel();
    assert!(!handler.is_running());
    assert_eq!(handler.pid(), None);
    assert_eq!(handler.state(), PasswdState::None);
    assert!(!handler.dispatch_next().await);
    assert!(calls.lock().unwrap().is_empty());

    handler.destroy();
}

#[tokio::test]
async fn external_timeout_then_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let mut handler = PasswdHandler::new(fake_passwd(&dir, HANGING_SCRIPT));

    handler.authenticate_and_wait("old-secret").await.unwrap();
    let result = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        handler.change_password_and_wait("new-secret-1"),
    )
    .await;
    assert!(result.is_err());
    assert!(handler.is_changing_password());

    handler.destroy();
}

#[tokio::test]
async fn teardown_without_backend_is_noop() {
    let mut handler = PasswdHandler::new(BackendConfig::default());
    handler.teardown();
    handler.teardown();
    assert!(!handler.is_running());
    assert_eq!(handler.state(), PasswdState::None);
    assert!(!handler.dispatch_next().await);
}

#[tokio::test]
async fn missing_program_is_reported_synchronously() {
    let mut handler = PasswdHandler::new(BackendConfig::with_program("/nonexistent/passwd"));

    let (calls, cb) = recorder();
    let err = handler.authenticate("old-secret", cb).unwrap_err();
    assert!(matches!(err, PasswdError::Backend(_)));

    let (_, cb) = recorder();
    assert!(!handler.change_password("new-secret-1", cb));
    assert!(!handler.is_changing_password());
    assert!(calls.lock().unwrap().is_empty());
}
