use std::cell::Cell;
use std::rc::Rc;

use listener_tap::{
    AbortController, AddEventListenerOptions, Callback, Error, Event, EventHandler, EventTarget,
    ListenerOptions, Result, SessionConfig, setup,
};

fn counting_callback() -> (Callback, Rc<Cell<usize>>) {
    let count = Rc::new(Cell::new(0));
    let seen = Rc::clone(&count);
    let callback = Callback::function(move |_event: &Event| seen.set(seen.get() + 1));
    (callback, count)
}

fn once_options() -> ListenerOptions {
    ListenerOptions::Options(AddEventListenerOptions {
        once: true,
        ..AddEventListenerOptions::default()
    })
}

#[test]
fn click_listener_full_lifecycle() -> Result<()> {
    let session = setup(SessionConfig::default());
    let target = EventTarget::new();
    let (callback, count) = counting_callback();

    session.add_event_listener(&target, "click", Some(&callback), &ListenerOptions::Default)?;

    let listeners = session.get_event_listeners(&target);
    assert_eq!(listeners.len(), 1);
    let record = &listeners["click"][0];
    assert_eq!(record.event_type, "click");
    assert!(record.listener.same_handle(&callback));
    assert!(!record.use_capture);
    assert!(!record.passive);
    assert!(!record.once);

    target.dispatch("click")?;
    assert_eq!(count.get(), 1);
    assert_eq!(session.get_event_listeners(&target)["click"].len(), 1);

    session.remove_event_listener(&target, "click", Some(&callback), &ListenerOptions::Default)?;
    assert!(session.get_event_listeners(&target).is_empty());

    target.dispatch("click")?;
    assert_eq!(count.get(), 1);
    Ok(())
}

#[test]
fn once_listener_fires_exactly_once() -> Result<()> {
    let session = setup(SessionConfig::default());
    let target = EventTarget::new();
    let (callback, count) = counting_callback();

    session.add_event_listener(&target, "click", Some(&callback), &once_options())?;

    target.dispatch("click")?;
    assert_eq!(count.get(), 1);
    assert!(session.get_event_listeners(&target).is_empty());

    target.dispatch("click")?;
    assert_eq!(count.get(), 1);
    Ok(())
}

#[test]
fn aborting_the_token_unsubscribes_everywhere() -> Result<()> {
    let session = setup(SessionConfig::default());
    let target = EventTarget::new();
    let (callback, count) = counting_callback();
    let controller = AbortController::new();
    let options = ListenerOptions::Options(AddEventListenerOptions {
        signal: Some(controller.signal()),
        ..AddEventListenerOptions::default()
    });

    session.add_event_listener(&target, "click", Some(&callback), &options)?;
    assert_eq!(session.get_event_listeners(&target)["click"].len(), 1);

    controller.abort();
    assert!(session.get_event_listeners(&target).is_empty());
    assert_eq!(target.listener_count("click"), 0);

    target.dispatch("click")?;
    assert_eq!(count.get(), 0);
    Ok(())
}

#[test]
fn subscribing_with_a_fired_token_skips_the_primitive() -> Result<()> {
    let forwarded = Rc::new(Cell::new(0));
    let seen = Rc::clone(&forwarded);
    let session = setup(SessionConfig {
        subscribe: Some(Rc::new(
            move |target: &EventTarget, event_type: &str, callback, options| {
                seen.set(seen.get() + 1);
                target.subscribe(event_type, callback, options)
            },
        )),
        unsubscribe: None,
    });
    let target = EventTarget::new();
    let (callback, _) = counting_callback();
    let controller = AbortController::new();
    controller.abort();
    let options = ListenerOptions::Options(AddEventListenerOptions {
        signal: Some(controller.signal()),
        ..AddEventListenerOptions::default()
    });

    session.add_event_listener(&target, "click", Some(&callback), &options)?;
    assert_eq!(forwarded.get(), 0);
    assert!(session.get_event_listeners(&target).is_empty());
    Ok(())
}

#[test]
fn failing_subscribe_keeps_the_record_registered() {
    let session = setup(SessionConfig {
        subscribe: Some(Rc::new(|_: &EventTarget, event_type: &str, _, _| {
            Err(Error::Subscribe(format!("rejected {event_type}")))
        })),
        unsubscribe: None,
    });
    let target = EventTarget::new();
    let (callback, _) = counting_callback();

    match session.add_event_listener(&target, "click", Some(&callback), &ListenerOptions::Default) {
        Err(Error::Subscribe(message)) => {
            assert!(
                message.contains("rejected click"),
                "unexpected subscribe error message: {message}"
            );
        }
        other => panic!("expected subscribe to fail, got: {other:?}"),
    }

    // Registered-then-forward: the registry mutation precedes delegation and
    // is not rolled back when the primitive fails.
    assert_eq!(session.get_event_listeners(&target)["click"].len(), 1);
}

#[test]
fn failing_unsubscribe_still_clears_the_record() -> Result<()> {
    let session = setup(SessionConfig {
        subscribe: None,
        unsubscribe: Some(Rc::new(|_: &EventTarget, event_type: &str, _, _| {
            Err(Error::Unsubscribe(format!("rejected {event_type}")))
        })),
    });
    let target = EventTarget::new();
    let (callback, _) = counting_callback();

    session.add_event_listener(&target, "click", Some(&callback), &ListenerOptions::Default)?;

    match session.remove_event_listener(&target, "click", Some(&callback), &ListenerOptions::Default)
    {
        Err(Error::Unsubscribe(message)) => {
            assert!(
                message.contains("rejected click"),
                "unexpected unsubscribe error message: {message}"
            );
        }
        other => panic!("expected unsubscribe to fail, got: {other:?}"),
    }

    assert!(session.get_event_listeners(&target).is_empty());
    Ok(())
}

#[test]
fn independent_sessions_keep_independent_registries() -> Result<()> {
    let first = setup(SessionConfig::default());
    let second = setup(SessionConfig::default());
    let target = EventTarget::new();
    let (callback, _) = counting_callback();

    first.add_event_listener(&target, "click", Some(&callback), &ListenerOptions::Default)?;

    assert_eq!(first.get_event_listeners(&target)["click"].len(), 1);
    assert!(second.get_event_listeners(&target).is_empty());
    Ok(())
}

#[test]
fn handle_event_object_listener_round_trip() -> Result<()> {
    struct Recorder {
        invocations: Cell<usize>,
    }
    impl EventHandler for Recorder {
        fn handle_event(&self, _event: &Event) {
            self.invocations.set(self.invocations.get() + 1);
        }
    }

    let session = setup(SessionConfig::default());
    let target = EventTarget::new();
    let recorder = Rc::new(Recorder {
        invocations: Cell::new(0),
    });
    let handler: Rc<dyn EventHandler> = recorder.clone();
    let callback = Callback::handler(handler);

    session.add_event_listener(&target, "click", Some(&callback), &ListenerOptions::Default)?;
    target.dispatch("click")?;
    assert_eq!(recorder.invocations.get(), 1);

    let listeners = session.get_event_listeners(&target);
    assert!(listeners["click"][0].listener.same_handle(&callback));

    session.remove_event_listener(&target, "click", Some(&callback), &ListenerOptions::Default)?;
    target.dispatch("click")?;
    assert_eq!(recorder.invocations.get(), 1);
    Ok(())
}

#[test]
fn duplicate_once_subscription_stays_in_lockstep_with_primitive() -> Result<()> {
    let session = setup(SessionConfig::default());
    let target = EventTarget::new();
    let (callback, count) = counting_callback();

    session.add_event_listener(&target, "click", Some(&callback), &once_options())?;
    session.add_event_listener(&target, "click", Some(&callback), &once_options())?;

    // The duplicate is forwarded with the already-registered wrapper, so the
    // primitive's own dedup rule keeps a single native registration.
    assert_eq!(target.listener_count("click"), 1);
    assert_eq!(session.get_event_listeners(&target)["click"].len(), 1);

    target.dispatch("click")?;
    assert_eq!(count.get(), 1);
    assert!(session.get_event_listeners(&target).is_empty());
    assert_eq!(target.listener_count("click"), 0);

    target.dispatch("click")?;
    assert_eq!(count.get(), 1);
    Ok(())
}

#[test]
fn query_inside_once_callback_sees_the_removal() -> Result<()> {
    let session = setup(SessionConfig::default());
    let target = EventTarget::new();
    let observed_empty = Rc::new(Cell::new(false));

    let inner_session = session.clone();
    let inner_target = target.clone();
    let observed = Rc::clone(&observed_empty);
    let callback = Callback::function(move |_event: &Event| {
        observed.set(inner_session.get_event_listeners(&inner_target).is_empty());
    });

    session.add_event_listener(&target, "click", Some(&callback), &once_options())?;
    target.dispatch("click")?;
    assert!(observed_empty.get());
    Ok(())
}

#[test]
fn listener_subscribed_during_dispatch_lands_in_the_registry() -> Result<()> {
    let session = setup(SessionConfig::default());
    let target = EventTarget::new();
    let (late, late_count) = counting_callback();

    let inner_session = session.clone();
    let inner_target = target.clone();
    let first = Callback::function(move |_event: &Event| {
        inner_session
            .add_event_listener(&inner_target, "click", Some(&late), &ListenerOptions::Default)
            .unwrap();
    });

    session.add_event_listener(&target, "click", Some(&first), &ListenerOptions::Default)?;

    // The dispatch snapshot was taken before the mid-flight subscription, so
    // the late listener does not run this round.
    target.dispatch("click")?;
    assert_eq!(late_count.get(), 0);
    assert_eq!(session.get_event_listeners(&target)["click"].len(), 2);

    target.dispatch("click")?;
    assert_eq!(late_count.get(), 1);
    Ok(())
}
