#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::StdRng};
use tokenbridge_interfaces::{Attribute, KeyType, ObjectClass, ObjectHandle, TokenBackend};
use tokenbridge_logger::log_init;
use tokenbridge_soft_token::{SoftToken, SoftTokenConfig, TokenEvent};
use zeroize::Zeroizing;

use crate::{HError, HResult, Session, SessionPoolConfig, Token, TokenConfig};

fn setup(config: TokenConfig) -> HResult<(Arc<SoftToken>, Arc<Token>)> {
    log_init(None);
    let soft = Arc::new(SoftToken::new(SoftTokenConfig {
        removable: true,
        ..SoftTokenConfig::default()
    }));
    let token = Token::new(soft.clone(), config)?;
    Ok((soft, token))
}

#[test]
fn test_acquire_order() -> HResult<()> {
    let (soft, token) = setup(TokenConfig::default())?;
    let manager = token.session_manager();

    let object_session = manager.acquire_object_session()?;
    manager.add_object(&object_session);
    manager.release(object_session.clone());
    assert_eq!(manager.stats().object_pool, 1);

    // opening a session is preferred over taking an object session
    let operation_session = manager.acquire_operation_session()?;
    assert_ne!(operation_session.handle(), object_session.handle());
    assert_eq!(soft.open_sessions(), 2);
    manager.release(operation_session.clone());

    // object sessions come first for objects, then operation sessions
    let session = manager.acquire_object_session()?;
    assert_eq!(session.handle(), object_session.handle());
    let other = manager.acquire_object_session()?;
    assert_eq!(other.handle(), operation_session.handle());
    manager.release(session);
    manager.release(other);

    let stats = manager.stats();
    assert_eq!(stats.open, 2);
    assert_eq!(stats.object_pool, 1);
    assert_eq!(stats.operation_pool, 1);
    assert_eq!(stats.checked_out(), 0);
    Ok(())
}

#[test]
fn test_max_sessions() -> HResult<()> {
    let (soft, token) = setup(TokenConfig {
        max_sessions: Some(2),
        ..TokenConfig::default()
    })?;
    let manager = token.session_manager();
    assert_eq!(manager.max_sessions(), Some(2));

    let first = manager.acquire_operation_session()?;
    let second = manager.acquire_object_session()?;
    assert!(matches!(
        manager.acquire_operation_session(),
        Err(HError::ResourceExhausted(_))
    ));
    assert!(matches!(
        manager.acquire_object_session(),
        Err(HError::ResourceExhausted(_))
    ));

    // at the maximum, operations fall back on object sessions
    manager.add_object(&second);
    manager.release(second.clone());
    let reused = manager.acquire_operation_session()?;
    assert_eq!(reused.handle(), second.handle());
    manager.release(reused);
    manager.release(first);
    assert_eq!(soft.open_sessions(), 2);
    assert_eq!(manager.stats().open, 2);
    Ok(())
}

#[test]
fn test_token_session_limit() -> HResult<()> {
    log_init(None);
    let soft = Arc::new(SoftToken::new(SoftTokenConfig {
        max_sessions: Some(1),
        ..SoftTokenConfig::default()
    }));
    let token = Token::new(soft.clone(), TokenConfig::default())?;
    let manager = token.session_manager();
    let session = manager.acquire_operation_session()?;
    assert!(matches!(
        manager.acquire_operation_session(),
        Err(HError::ResourceExhausted(_))
    ));
    assert_eq!(manager.stats().open, 1);
    manager.release(session);
    Ok(())
}

#[test]
fn test_idle_eviction() -> HResult<()> {
    let (soft, token) = setup(TokenConfig {
        session_pool: SessionPoolConfig {
            eviction_threshold: 2,
            max_idle_secs: 0,
            min_open: 1,
        },
        ..TokenConfig::default()
    })?;
    let manager = token.session_manager();

    let owner = manager.acquire_object_session()?;
    manager.add_object(&owner);
    let sessions = (0..3)
        .map(|_| manager.acquire_operation_session())
        .collect::<HResult<Vec<_>>>()?;
    manager.release(owner.clone());
    assert_eq!(manager.stats().open, 4);
    for session in sessions {
        manager.release(session);
    }

    // idle operation sessions are closed, the object session is kept
    let stats = manager.stats();
    assert_eq!(stats.object_pool, 1);
    assert!(stats.open < 4);
    assert!(stats.open >= 1);
    assert_eq!(soft.open_sessions(), stats.open);
    assert!(!soft.events().iter().any(|event| matches!(
        event,
        TokenEvent::SessionClosed { session, .. } if *session == owner.handle()
    )));
    Ok(())
}

#[test]
fn test_kill() -> HResult<()> {
    let (soft, token) = setup(TokenConfig::default())?;
    let manager = token.session_manager();

    let session = manager.acquire_operation_session()?;
    let handle = session.handle();
    manager.kill(session);
    assert_eq!(manager.stats().open, 0);
    assert!(soft.events().contains(&TokenEvent::SessionClosed {
        session: handle,
        owned_objects: 0
    }));

    // a session owning objects is pooled instead
    let owner = manager.acquire_object_session()?;
    manager.add_object(&owner);
    manager.kill(owner);
    let stats = manager.stats();
    assert_eq!(stats.open, 1);
    assert_eq!(stats.object_pool, 1);
    Ok(())
}

#[test]
fn test_demotion() -> HResult<()> {
    let (_soft, token) = setup(TokenConfig::default())?;
    let manager = token.session_manager();

    let session = manager.acquire_object_session()?;
    manager.add_object(&session);
    manager.add_object(&session);
    manager.release(session.clone());

    manager.remove_object(&session);
    assert_eq!(manager.stats().object_pool, 1);
    manager.remove_object(&session);
    let stats = manager.stats();
    assert_eq!(stats.object_pool, 0);
    assert_eq!(stats.operation_pool, 1);

    // the demotion of a checked out session happens on release
    let session = manager.acquire_object_session()?;
    manager.add_object(&session);
    manager.remove_object(&session);
    manager.release(session);
    assert_eq!(manager.stats().operation_pool, 1);
    Ok(())
}

#[test]
fn test_invalid_token() -> HResult<()> {
    let (soft, token) = setup(TokenConfig {
        presence_check_interval_ms: 0,
        ..TokenConfig::default()
    })?;
    let manager = token.session_manager();
    let session = manager.acquire_operation_session()?;

    soft.remove();
    assert!(matches!(
        token.ensure_valid(),
        Err(HError::TokenInvalid(_))
    ));
    // the session is abandoned, not closed
    manager.release(session);
    assert_eq!(manager.stats().open, 0);
    assert_eq!(soft.call_count("C_CloseSession"), 0);
    assert!(matches!(
        token.acquire_operation_session(),
        Err(HError::TokenInvalid(_))
    ));
    Ok(())
}

#[test]
fn test_random_sequences() -> HResult<()> {
    const MAX_SESSIONS: usize = 4;

    let (soft, token) = setup(TokenConfig {
        max_sessions: Some(MAX_SESSIONS),
        session_pool: SessionPoolConfig {
            eviction_threshold: 1,
            max_idle_secs: 0,
            min_open: 1,
        },
        ..TokenConfig::default()
    })?;
    let manager = token.session_manager();
    let mut rng = StdRng::seed_from_u64(0x5e55_1045);
    let mut checked_out: Vec<Arc<Session>> = Vec::new();
    let mut objects: Vec<(Arc<Session>, ObjectHandle)> = Vec::new();

    for step in 0u32..2000 {
        match rng.random_range(0..6) {
            0 | 1 => {
                let acquired = if rng.random_bool(0.5) {
                    manager.acquire_object_session()
                } else {
                    manager.acquire_operation_session()
                };
                match acquired {
                    Ok(session) => checked_out.push(session),
                    Err(HError::ResourceExhausted(_)) => {
                        assert_eq!(checked_out.len(), MAX_SESSIONS, "step {step}");
                    }
                    Err(e) => return Err(e),
                }
            }
            2 if !checked_out.is_empty() => {
                let session = checked_out.swap_remove(rng.random_range(0..checked_out.len()));
                manager.release(session);
            }
            3 if !checked_out.is_empty() => {
                let session = &checked_out[rng.random_range(0..checked_out.len())];
                let object = soft
                    .create_object(
                        session.handle(),
                        &[
                            Attribute::Class(ObjectClass::SecretKey),
                            Attribute::KeyType(KeyType::Aes),
                            Attribute::Token(false),
                            Attribute::Value(Zeroizing::new(vec![step.to_le_bytes()[0]; 16])),
                        ],
                    )
                    .unwrap();
                manager.add_object(session);
                objects.push((session.clone(), object));
            }
            4 if !objects.is_empty() => {
                let (owner, object) = objects.swap_remove(rng.random_range(0..objects.len()));
                soft.destroy_object(owner.handle(), object).unwrap();
                manager.remove_object(&owner);
            }
            5 if !checked_out.is_empty() => {
                let session = checked_out.swap_remove(rng.random_range(0..checked_out.len()));
                manager.kill(session);
            }
            _ => {}
        }

        let stats = manager.stats();
        assert!(stats.open <= MAX_SESSIONS, "step {step}: {stats:?}");
        assert_eq!(soft.open_sessions(), stats.open, "step {step}");
        assert_eq!(stats.checked_out(), checked_out.len(), "step {step}: {stats:?}");
        assert_eq!(soft.session_objects(), objects.len(), "step {step}");
    }

    // no session was closed while owning objects
    assert!(soft.events().iter().all(|event| !matches!(
        event,
        TokenEvent::SessionClosed { owned_objects, .. } if *owned_objects > 0
    )));
    for session in checked_out {
        manager.release(session);
    }
    Ok(())
}
