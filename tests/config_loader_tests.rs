use freshd::config::ConfigLoader;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        env::remove_var("FRESHD_PROFILE");
        env::remove_var("FRESHD_STATE_DIR");
        env::remove_var("FRESHD_LOG_LEVEL");
        env::remove_var("FRESHD_BACKENDS_FILE");
        env::remove_var("FRESHD_SCHEDULER_DEBOUNCE_SECONDS");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.state_dir, PathBuf::from(".freshd"));
    assert_eq!(cfg.backends_file, PathBuf::from("backends.json"));
    assert_eq!(cfg.scheduler.base_interval_seconds, 180);
    assert_eq!(cfg.pool.max_workers, 4);
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "FRESHD_STATE_DIR=/var/lib/freshd-base\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "FRESHD_STATE_DIR=/var/lib/freshd-test\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "FRESHD_STATE_DIR=/var/lib/freshd-test-local\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "FRESHD_PROFILE=test\nFRESHD_STATE_DIR=/var/lib/freshd-local\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.state_dir, PathBuf::from("/var/lib/freshd-test-local"));
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "FRESHD_STATE_DIR=/var/lib/freshd-from-file\nFRESHD_LOG_LEVEL=debug\n",
    );

    unsafe {
        env::set_var("FRESHD_STATE_DIR", "/var/lib/freshd-from-process");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.state_dir, PathBuf::from("/var/lib/freshd-from-process"));
    assert_eq!(cfg.log_level, "debug");

    clear_env();
}

#[test]
fn out_of_bounds_values_fail_validation() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("FRESHD_SCHEDULER_DEBOUNCE_SECONDS", "0");
    }
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("zero debounce should fail");
    assert!(format!("{}", err).contains("debounce window"));

    clear_env();
}
