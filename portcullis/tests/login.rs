mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{
    Accounts, PASSWORD, StaticCaptcha, SwitchableStore, browser, clock, init_tracing,
    without_captcha,
};
use portcullis::{
    Clock, LoginError, LoginRequest, LoginSecurityConfig, LoginType, ManualClock, Portcullis,
    PortcullisBuilder, PortcullisBuilderError, PortcullisError, StoreKind,
};

const USER: &str = "user@example.com";
const IP: &str = "203.0.113.7";

async fn setup() -> (Arc<ManualClock>, Arc<Accounts>, Portcullis) {
    init_tracing();
    let clock = clock();
    let accounts = Accounts::new(&[(USER, "usr_1"), ("other@example.com", "usr_2")]);
    let portcullis = PortcullisBuilder::new()
        .with_clock(clock.clone())
        .with_memory_store()
        .with_login_security_config(without_captcha())
        .build(accounts.clone(), accounts.clone())
        .await
        .unwrap();
    (clock, accounts, portcullis)
}

fn attempt(password: &str) -> LoginRequest {
    LoginRequest::new(USER, password, browser(IP))
}

#[tokio::test]
async fn test_login_creates_session() {
    let (_clock, _accounts, portcullis) = setup().await;
    assert_eq!(portcullis.store_kind(), StoreKind::Fast);

    let login = portcullis.login(attempt(PASSWORD)).await.unwrap();
    assert_eq!(login.user_id.as_str(), "usr_1");
    assert_eq!(login.session.session_id.as_str().len(), 64);
    assert!(login.session.remember_me_token.is_none());
    assert_eq!(login.security_context.unwrap().risk_score, 25);

    let validation = portcullis
        .authenticate(&login.session.session_id, &browser(IP))
        .await
        .unwrap();
    assert_eq!(validation.user_id.unwrap().as_str(), "usr_1");

    let destroyed = portcullis
        .logout(&login.session.session_id, None)
        .await
        .unwrap();
    assert_eq!(destroyed.destroyed, 1);

    let result = portcullis
        .authenticate(&login.session.session_id, &browser(IP))
        .await;
    assert!(matches!(result, Err(PortcullisError::Unauthenticated(reason)) if reason == "not found or expired"));
}

#[tokio::test]
async fn test_failures_are_generic() {
    let (_clock, _accounts, portcullis) = setup().await;

    let wrong_password = portcullis.login(attempt("nope")).await.unwrap_err();
    assert!(matches!(wrong_password, LoginError::InvalidCredentials));

    let unknown = portcullis
        .login(LoginRequest::new("ghost@example.com", PASSWORD, browser(IP)))
        .await
        .unwrap_err();
    assert!(matches!(unknown, LoginError::InvalidCredentials));
    assert_eq!(unknown.to_string(), wrong_password.to_string());

    assert_eq!(
        portcullis.security().get_failed_attempts(IP, USER).await.unwrap(),
        1
    );
    assert_eq!(portcullis.security().get_ip_attempts(IP).await.unwrap(), 2);
}

#[tokio::test]
async fn test_lockout_after_five_failures() {
    let (clock, accounts, portcullis) = setup().await;

    for _ in 0..5 {
        let error = portcullis.login(attempt("nope")).await.unwrap_err();
        assert!(matches!(error, LoginError::InvalidCredentials));
        clock.advance(Duration::minutes(1));
    }
    let verified = accounts.verifications();

    // The right password does not help while locked, and is never checked.
    let error = portcullis.login(attempt(PASSWORD)).await.unwrap_err();
    match error {
        LoginError::Locked { remaining } => {
            assert_eq!(remaining, Duration::minutes(10));
        }
        other => panic!("expected lockout, got {other:?}"),
    }
    assert_eq!(accounts.verifications(), verified);
    assert!(error_message_states_time(&portcullis).await);

    clock.advance(Duration::minutes(11));
    portcullis.login(attempt(PASSWORD)).await.unwrap();
}

async fn error_message_states_time(portcullis: &Portcullis) -> bool {
    portcullis
        .login(attempt(PASSWORD))
        .await
        .unwrap_err()
        .to_string()
        .contains("600 seconds")
}

#[tokio::test]
async fn test_success_resets_identifier_but_not_ip() {
    let (clock, _accounts, portcullis) = setup().await;

    portcullis.login(attempt("nope")).await.unwrap_err();
    clock.advance(Duration::seconds(5));
    portcullis.login(attempt("nope")).await.unwrap_err();
    clock.advance(Duration::seconds(5));
    portcullis.login(attempt(PASSWORD)).await.unwrap();

    let security = portcullis.security();
    assert_eq!(security.get_failed_attempts(IP, USER).await.unwrap(), 0);
    assert_eq!(security.get_delay_info(IP, USER).await.unwrap().delay_ms, 0);
    assert_eq!(security.get_ip_attempts(IP).await.unwrap(), 2);
}

#[tokio::test]
async fn test_progressive_delay() {
    let (clock, _accounts, portcullis) = setup().await;

    portcullis.login(attempt("nope")).await.unwrap_err();
    match portcullis.login(attempt(PASSWORD)).await.unwrap_err() {
        LoginError::RateLimited { retry_after } => assert_eq!(retry_after, Duration::seconds(1)),
        other => panic!("expected rate limit, got {other:?}"),
    }

    clock.advance(Duration::seconds(1));
    portcullis.login(attempt(PASSWORD)).await.unwrap();
}

#[tokio::test]
async fn test_ip_block_spans_identifiers() {
    let (clock, _accounts, portcullis) = setup().await;

    for i in 0..10 {
        let request = LoginRequest::new(format!("probe{i}@example.com"), "guess", browser(IP));
        portcullis.login(request).await.unwrap_err();
        clock.advance(Duration::seconds(1));
    }

    match portcullis.login(attempt(PASSWORD)).await.unwrap_err() {
        LoginError::IpBlocked { remaining } => {
            assert!(remaining <= Duration::hours(1));
            assert!(remaining > Duration::minutes(59));
        }
        other => panic!("expected IP block, got {other:?}"),
    }

    // Another address is unaffected.
    portcullis
        .login(LoginRequest::new(USER, PASSWORD, browser("198.51.100.1")))
        .await
        .unwrap();

    assert!(portcullis.security().unblock_ip(IP).await.unwrap());
    portcullis.login(attempt(PASSWORD)).await.unwrap();
}

#[tokio::test]
async fn test_captcha_escalation() {
    init_tracing();
    let clock = clock();
    let accounts = Accounts::new(&[(USER, "usr_1")]);
    let portcullis = PortcullisBuilder::new()
        .with_clock(clock.clone())
        .with_memory_store()
        .with_captcha_verifier(Arc::new(StaticCaptcha("human")))
        .build(accounts.clone(), accounts.clone())
        .await
        .unwrap();

    for _ in 0..3 {
        portcullis.login(attempt("nope")).await.unwrap_err();
        clock.advance(Duration::minutes(1));
    }

    let error = portcullis.login(attempt(PASSWORD)).await.unwrap_err();
    assert!(matches!(error, LoginError::CaptchaRequired));

    let error = portcullis
        .login(attempt(PASSWORD).with_captcha_token("robot"))
        .await
        .unwrap_err();
    assert!(matches!(error, LoginError::CaptchaRequired));
    assert_eq!(
        portcullis.security().get_failed_attempts(IP, USER).await.unwrap(),
        4
    );

    clock.advance(Duration::minutes(1));
    let login = portcullis
        .login(attempt(PASSWORD).with_captcha_token("human"))
        .await
        .unwrap();
    assert!(login.security_context.unwrap().requires_captcha);
}

#[tokio::test]
async fn test_device_novelty() {
    let (_clock, _accounts, portcullis) = setup().await;

    let first = portcullis.login(attempt(PASSWORD)).await.unwrap();
    assert!(first.new_device);

    let second = portcullis.login(attempt(PASSWORD)).await.unwrap();
    assert!(!second.new_device);
    assert_eq!(second.security_context.unwrap().risk_score, 0);

    // The address is part of the fingerprint.
    let roaming = portcullis
        .login(LoginRequest::new(USER, PASSWORD, browser("198.51.100.1")))
        .await
        .unwrap();
    assert!(roaming.new_device);

    let phone = browser(IP).with_user_agent("Mozilla/5.0 (iPhone) Safari/604.1");
    let third = portcullis
        .login(LoginRequest::new(USER, PASSWORD, phone))
        .await
        .unwrap();
    assert!(third.new_device);
}

#[tokio::test]
async fn test_remember_me_round_trip() {
    let (clock, _accounts, portcullis) = setup().await;

    let login = portcullis
        .login(attempt(PASSWORD).with_remember_me(true))
        .await
        .unwrap();
    let token = login.session.remember_me_token.clone().unwrap();
    assert_eq!(token.expires_at - clock.now(), Duration::days(30));

    let resumed = portcullis
        .login_with_remember_me(&token.token, &browser(IP))
        .await
        .unwrap();
    assert_eq!(resumed.user_id.as_str(), "usr_1");
    assert_ne!(resumed.session.session_id, login.session.session_id);
    let validation = portcullis
        .authenticate(&resumed.session.session_id, &browser(IP))
        .await
        .unwrap();
    assert_eq!(
        validation.session.unwrap().login_type,
        LoginType::RememberMe
    );

    let other_device = browser(IP).with_user_agent("curl/8.5.0");
    let error = portcullis
        .login_with_remember_me(&token.token, &other_device)
        .await
        .unwrap_err();
    assert!(matches!(error, LoginError::InvalidCredentials));

    portcullis
        .logout(&login.session.session_id, Some(&token.token))
        .await
        .unwrap();
    let error = portcullis
        .login_with_remember_me(&token.token, &browser(IP))
        .await
        .unwrap_err();
    assert!(matches!(error, LoginError::InvalidCredentials));
}

#[tokio::test]
async fn test_remember_me_expires_with_old_data() {
    let (clock, _accounts, portcullis) = setup().await;

    let login = portcullis
        .login(attempt(PASSWORD).with_remember_me(true))
        .await
        .unwrap();
    let token = login.session.remember_me_token.unwrap();

    clock.advance(Duration::days(1));
    let removed = portcullis
        .security()
        .expire_old_data(clock.now())
        .await
        .unwrap();
    assert!(removed > 0);

    let error = portcullis
        .login_with_remember_me(&token.token, &browser(IP))
        .await
        .unwrap_err();
    assert!(matches!(error, LoginError::InvalidCredentials));
}

#[tokio::test]
async fn test_logout_everywhere() {
    let (_clock, _accounts, portcullis) = setup().await;

    let laptop = portcullis.login(attempt(PASSWORD)).await.unwrap();
    let phone = portcullis
        .login(LoginRequest::new(USER, PASSWORD, browser("198.51.100.1")))
        .await
        .unwrap();
    assert_eq!(
        portcullis.get_user_sessions(&laptop.user_id).await.unwrap().len(),
        2
    );

    let destroyed = portcullis.logout_everywhere(&laptop.user_id).await.unwrap();
    assert_eq!(destroyed.destroyed, 2);
    assert!(
        portcullis
            .authenticate(&phone.session.session_id, &browser("198.51.100.1"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_builder_rejects_captcha_at_or_above_lockout() {
    let accounts = Accounts::new(&[]);
    let result = PortcullisBuilder::new()
        .with_memory_store()
        .with_login_security_config(LoginSecurityConfig {
            captcha_threshold: 5,
            ..Default::default()
        })
        .build(accounts.clone(), accounts)
        .await;
    assert!(matches!(
        result,
        Err(PortcullisBuilderError::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_builder_requires_captcha_verifier_while_escalation_is_on() {
    let accounts = Accounts::new(&[]);
    let result = PortcullisBuilder::new()
        .with_memory_store()
        .build(accounts.clone(), accounts)
        .await;
    match result {
        Err(PortcullisBuilderError::InvalidConfiguration(message)) => {
            assert!(message.contains("no captcha verifier"));
        }
        Err(other) => panic!("expected invalid configuration, got {other:?}"),
        Ok(_) => panic!("built without a captcha verifier"),
    }
}

#[tokio::test]
async fn test_uncounted_failure_refuses_login() {
    init_tracing();
    let clock = clock();
    let store = SwitchableStore::new(clock.clone());
    let accounts = Accounts::new(&[(USER, "usr_1")]);
    let portcullis = PortcullisBuilder::new()
        .with_clock(clock.clone())
        .with_store(store.clone())
        .with_login_security_config(without_captcha())
        .build(accounts.clone(), accounts.clone())
        .await
        .unwrap();

    // Reads still answer, so the gates pass, but no failure can be counted.
    store.set_writable(false);
    for _ in 0..20 {
        let error = portcullis.login(attempt("nope")).await.unwrap_err();
        assert!(matches!(error, LoginError::Unavailable));
        clock.advance(Duration::seconds(5));
    }
    let error = portcullis.login(attempt(PASSWORD)).await.unwrap_err();
    assert!(matches!(error, LoginError::Unavailable));

    store.set_writable(true);
    let error = portcullis.login(attempt("nope")).await.unwrap_err();
    assert!(matches!(error, LoginError::InvalidCredentials));
    assert_eq!(
        portcullis.security().get_failed_attempts(IP, USER).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_disabled_protection_never_blocks() {
    init_tracing();
    let accounts = Accounts::new(&[(USER, "usr_1")]);
    let portcullis = PortcullisBuilder::new()
        .with_memory_store()
        .with_login_security_config(LoginSecurityConfig::disabled())
        .build(accounts.clone(), accounts)
        .await
        .unwrap();

    for _ in 0..20 {
        portcullis.login(attempt("nope")).await.unwrap_err();
    }
    portcullis.login(attempt(PASSWORD)).await.unwrap();
}
