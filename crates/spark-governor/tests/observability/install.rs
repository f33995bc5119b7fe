use spark_governor::install_tracing;
use spark_governor::observability::{DEFAULT_DIRECTIVE, TracingInstallError};

/// 第一次安装成功后，再次安装必须被拒绝，且不替换已有订阅者。
#[test]
fn second_install_is_refused() {
    install_tracing(DEFAULT_DIRECTIVE).expect("first install succeeds in a fresh process");
    tracing::info!("governor tracing installed");

    assert!(matches!(
        install_tracing("debug"),
        Err(TracingInstallError::AlreadyInstalled)
    ));
}
