use std::error::Error;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use cmdloop::cli::CliArgs;
use cmdloop::config::{load_and_validate, load_or_default};
use cmdloop::types::LogLevelSetting;
use cmdloop::{CmdloopError, Command, Coroutine, ManualClock, Scheduler, load_config};

type TestResult = Result<(), Box<dyn Error>>;

fn config_file(contents: &str) -> Result<NamedTempFile, Box<dyn Error>> {
    let mut file = NamedTempFile::new()?;
    write!(file, "{contents}")?;
    Ok(file)
}

#[test]
fn full_config_is_loaded_and_applied() -> TestResult {
    let file = config_file(
        r#"
[scheduler]
period_ms = 10
stack_size_kib = 128
thread_name_prefix = "bot"
stop_on_error = true

[logging]
level = "warning"
"#,
    )?;

    let cfg = load_and_validate(file.path())?;
    assert_eq!(cfg.scheduler.period_ms, 10);
    assert!(cfg.scheduler.stop_on_error);
    assert_eq!(cfg.logging.level, Some(LogLevelSetting::Warn));

    let scheduler = Scheduler::from_config(&cfg, Arc::new(ManualClock::new()));
    assert_eq!(scheduler.options().stack_size, 128 * 1024);

    let thread_name = Arc::new(Mutex::new(None));
    let cmd = {
        let thread_name = thread_name.clone();
        Command::no_requirements("Named", move |_: &Coroutine| {
            *thread_name.lock() = std::thread::current().name().map(str::to_string);
            Ok(())
        })
    };
    scheduler.schedule(&cmd)?;
    scheduler.tick()?;

    assert_eq!(thread_name.lock().as_deref(), Some("bot-1"));
    Ok(())
}

#[test]
fn missing_sections_fall_back_to_defaults() -> TestResult {
    let file = config_file("[logging]\n")?;

    let cfg = load_and_validate(file.path())?;
    assert_eq!(cfg.scheduler.period_ms, 20);
    assert_eq!(cfg.scheduler.stack_size_kib, 256);
    assert_eq!(cfg.scheduler.thread_name_prefix, "cmd");
    assert_eq!(cfg.logging.level, None);
    Ok(())
}

#[test]
fn unknown_keys_are_rejected() -> TestResult {
    let file = config_file("[scheduler]\nperiod = 10\n")?;

    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, CmdloopError::TomlError(_)));
    Ok(())
}

#[test]
fn out_of_range_values_are_rejected() -> TestResult {
    let file = config_file("[scheduler]\nstack_size_kib = 8\n")?;

    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, CmdloopError::ConfigError(_)));
    assert!(err.to_string().contains("stack_size_kib must be >= 64"));
    Ok(())
}

#[test]
fn missing_file_is_an_error_unless_defaults_are_allowed() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Cmdloop.toml");

    assert!(matches!(
        load_and_validate(&path).unwrap_err(),
        CmdloopError::IoError(_)
    ));
    let cfg = load_or_default(&path)?;
    assert_eq!(cfg.scheduler.period_ms, 20);
    Ok(())
}

#[test]
fn explicit_config_path_must_exist() -> TestResult {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("elsewhere.toml");
    let args = CliArgs {
        config: missing.display().to_string(),
        ticks: None,
        log_level: None,
        dry_run: false,
    };

    let err = load_config(&args).unwrap_err();
    assert!(format!("{err:#}").contains("elsewhere.toml"));
    Ok(())
}
