#![cfg(test)]

use crate::config::config::Config;
use serial_test::serial;

#[test]
#[serial]
fn defaults_apply_when_unset() {
    let vars = [
        "DICOM_RECEIVER_DATA_DIR",
        "DICOM_RECEIVER_PORT",
        "DICOM_RECEIVER_AE_TITLE",
        "DICOM_RECEIVER_API_URL",
        "DICOM_RECEIVER_AUTO_UPLOAD",
    ];
    for v in vars {
        std::env::remove_var(v);
    }

    let config = Config::from_env();
    assert_eq!(config.port, 11112);
    assert_eq!(config.ae_title, "DICOMRCV");
    assert_eq!(config.timeout_secs, 60);
    assert!(!config.auto_upload);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn env_overrides_are_applied() {
    std::env::set_var("DICOM_RECEIVER_PORT", "4242");
    std::env::set_var("DICOM_RECEIVER_AE_TITLE", "TESTAE");
    std::env::set_var("DICOM_RECEIVER_TIMEOUT", "120");

    let config = Config::from_env();
    assert_eq!(config.port, 4242);
    assert_eq!(config.ae_title, "TESTAE");
    assert_eq!(config.timeout_secs, 120);

    std::env::remove_var("DICOM_RECEIVER_PORT");
    std::env::remove_var("DICOM_RECEIVER_AE_TITLE");
    std::env::remove_var("DICOM_RECEIVER_TIMEOUT");
}

#[test]
#[serial]
fn auto_upload_requires_api_url() {
    std::env::set_var("DICOM_RECEIVER_AUTO_UPLOAD", "true");
    std::env::set_var("DICOM_RECEIVER_API_URL", "");

    let config = Config::from_env();
    assert!(config.validate().is_err());

    std::env::remove_var("DICOM_RECEIVER_AUTO_UPLOAD");
    std::env::remove_var("DICOM_RECEIVER_API_URL");
}

#[test]
fn ae_title_length_is_bounded() {
    let mut config = Config::from_env();
    config.ae_title = "A".repeat(17);
    assert!(config.validate().is_err());
    config.ae_title = String::new();
    assert!(config.validate().is_err());
}
