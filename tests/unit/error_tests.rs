//! Unit tests for `LinkError` display formats.

use vmlink::LinkError;

#[test]
fn category_variants_are_prefixed() {
    assert_eq!(
        LinkError::Config("bad".into()).to_string(),
        "config: bad"
    );
    assert_eq!(LinkError::Io("gone".into()).to_string(), "io: gone");
    assert_eq!(
        LinkError::Dial("cannot connect".into()).to_string(),
        "dial: cannot connect"
    );
    assert_eq!(LinkError::Exec("exit 1".into()).to_string(), "exec: exit 1");
    assert_eq!(
        LinkError::Image("missing".into()).to_string(),
        "image: missing"
    );
    assert_eq!(
        LinkError::Cancelled("job".into()).to_string(),
        "cancelled: job"
    );
}

#[test]
fn fixed_variants_have_no_prefix() {
    let errs = [
        LinkError::ProcessExited {
            address: "a".into(),
            wstatus: 0,
        },
        LinkError::KillTimeout { job: "j".into() },
        LinkError::InvalidBios("x".into()),
    ];
    for err in errs {
        let text = err.to_string();
        assert!(
            !text.contains(": "),
            "fixed message must not carry a category prefix: {text}"
        );
    }
}

#[test]
fn toml_errors_convert_to_config() {
    let err: LinkError = toml::from_str::<toml::Value>("= nope")
        .expect_err("invalid toml")
        .into();
    assert!(err.to_string().starts_with("config: invalid config:"));
}

#[test]
fn io_errors_convert_to_io() {
    let err: LinkError = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file").into();
    assert_eq!(err.to_string(), "io: no such file");
}
