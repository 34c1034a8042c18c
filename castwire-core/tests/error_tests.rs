//! Integration tests for error handling

use castwire_core::error::{CastError, ResultExt};

#[test]
fn test_error_context_chaining() {
    let err = CastError::init("libx264 not found").with_context("Opening video encoder");

    let msg = format!("{}", err);
    assert!(msg.contains("Opening video encoder"));
    assert!(msg.contains("libx264 not found"));
    assert!(matches!(err.root(), CastError::FatalInit(_)));
}

#[test]
fn test_result_ext_context() {
    let result: Result<(), CastError> = Err(CastError::credentials("CASTWIRE_STREAM_KEY is not set"));
    let err = result.context("Starting stream").unwrap_err();

    assert!(format!("{}", err).starts_with("Starting stream: "));
    assert!(matches!(err.root(), CastError::Credentials(_)));
}

#[test]
fn test_context_preserves_classification_and_hint() {
    let err = CastError::source_lost("microphone unplugged")
        .with_context("audio source")
        .with_context("pipeline");

    assert!(err.is_fatal());
    assert_eq!(err.user_hint(), CastError::source_lost("x").user_hint());
}

#[test]
fn test_fatal_classification() {
    // Per-unit errors stay inside their stage
    assert!(!CastError::capture("grab timed out").is_fatal());
    assert!(!CastError::encode("bad frame").is_fatal());
    assert!(!CastError::MuxOrderViolation("video 100ms < 200ms".into()).is_fatal());
    // Write failures are retried by the transport
    assert!(!CastError::transport("broken pipe").is_fatal());

    assert!(CastError::source_lost("display gone").is_fatal());
    assert!(CastError::init("no encoder").is_fatal());
    assert!(CastError::config("zero fps").is_fatal());
}

#[test]
fn test_user_hints() {
    let hint = CastError::credentials("missing").user_hint().unwrap();
    assert!(hint.contains("CASTWIRE_STREAM_KEY"));

    let hint = CastError::config("bad").user_hint().unwrap();
    assert!(hint.contains("config.toml"));

    let hint = CastError::transport("refused").user_hint().unwrap();
    assert!(hint.contains("network"));

    assert!(CastError::encode("bad frame").user_hint().is_none());
}

#[test]
fn test_error_display_format() {
    assert_eq!(
        CastError::transport("connection reset").to_string(),
        "Transport error: connection reset"
    );
    assert_eq!(
        CastError::InvalidState("controller has exited".into()).to_string(),
        "Invalid state: controller has exited"
    );
    assert_eq!(CastError::encode("bad frame").to_string(), "Encoder error: bad frame");
}

#[test]
fn test_io_error_conversion() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
    let err: CastError = io_err.into();

    let msg = format!("{}", err);
    assert!(msg.contains("I/O error"));
    assert!(msg.contains("File not found"));
}
