//! Multi-coroutine and server-style scenarios: launch-result homing, event
//! loops with declines, retirement, early exit, and pre-marked satisfaction.

mod common;

use common::{MockTurtle, Painter};
use cotest::{run_cotest, CallPattern};
use std::sync::{Arc, Mutex};

#[test]
fn multi_launch_homing() {
    common::init();
    run_cotest("multi_launch_homing", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        cx.watch_call(CallPattern::any());

        let l1 = cx.launch({
            let painter = painter.clone();
            move || painter.draw_dot()
        });
        let c1 = cx.wait_for_call_from(&turtle.pen_down, &l1);
        assert!(c1.from(&l1).is_some());

        // A second launch completes while the first call is still open; its
        // result homes to us and is collected out of order.
        let l2 = cx.launch(move || painter.empty_method());
        let r2 = cx.wait_for_result_from(&l2);
        assert!(r2.is_some());
        assert!(r2.from(&l2).is_some());
        assert!(!r2.from(&l1).is_some());

        c1.return_void();
        cx.wait_for_call(&turtle.pen_up).return_void();
        let r1 = cx.wait_for_result_from(&l1);
        assert!(r1.is_some());
    });
}

#[test]
fn server_style_with_decline() {
    common::init();
    run_cotest("server_style_with_decline", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        // Declared below the watch, so declined calls land here.
        turtle.ink_check.expect().any_times().returning(|&()| ());
        cx.watch_call(CallPattern::any());

        let _l = cx.launch(move || painter.draw_square_ink_checks(5));

        let mut forwards = 0;
        let mut turns = 0;
        loop {
            let event = cx.next_event();
            let pen_up = event.is_call(&turtle.pen_up);
            if pen_up.is_some() {
                pen_up.return_void();
                break;
            }
            let forward = event.is_call(&turtle.forward);
            if forward.is_some() {
                forwards += 1;
                forward.return_void();
                continue;
            }
            let turn = event.is_call(&turtle.turn);
            if turn.is_some() {
                turns += 1;
                turn.return_void();
                continue;
            }
            let pen_down = event.is_call(&turtle.pen_down);
            if pen_down.is_some() {
                pen_down.return_void();
                continue;
            }
            // Ink checks: not ours, fall through to the expectation below.
            event.decline();
        }
        assert_eq!(forwards, 4);
        assert_eq!(turns, 4);

        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}

#[test]
fn retire_gates_oversaturation() {
    common::init();
    run_cotest("retire_gates_oversaturation", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        let log: Arc<Mutex<Vec<(&str, &str)>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let log = log.clone();
            cx.coroutine("low", move |cx| {
                cx.watch_call(CallPattern::any());
                let call = cx.wait_for_call(CallPattern::any());
                log.lock().expect("log").push(("low", call.method_name().expect("live")));
                call.return_void();
            });
        }
        {
            let log = log.clone();
            // Declared later: wins the first call, then steps aside.
            cx.coroutine("high", move |cx| {
                cx.watch_call(CallPattern::any());
                let call = cx.wait_for_call(CallPattern::any());
                log.lock().expect("log").push(("high", call.method_name().expect("live")));
                call.return_void();
                cx.retire();
            });
        }

        let _l = cx.launch(move || painter.draw_dot());
        let r = cx.wait_for_result();
        assert!(r.is_some());

        let seen = log.lock().expect("log").clone();
        assert_eq!(seen, vec![("high", "pen_down"), ("low", "pen_up")]);
    });
}

#[test]
fn coroutine_declared_before_launch_is_eligible() {
    common::init();
    run_cotest("coroutine_declared_before_launch_is_eligible", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        let handled = Arc::new(Mutex::new(0_u32));

        {
            let handled = handled.clone();
            let turtle = turtle.clone();
            cx.coroutine("dot-handler", move |cx| {
                cx.watch_call(CallPattern::any());
                cx.wait_for_call(&turtle.pen_down).return_void();
                cx.wait_for_call(&turtle.pen_up).return_void();
                *handled.lock().expect("count") += 1;
            });
        }

        let _l = cx.launch(move || painter.draw_dot());
        let r = cx.wait_for_result();
        assert!(r.is_some());
        assert_eq!(*handled.lock().expect("count"), 1);
    });
}

#[test]
fn exit_coroutine_ends_the_body_early() {
    common::init();
    run_cotest("exit_coroutine_ends_the_body_early", |cx| {
        let reached = Arc::new(Mutex::new(false));
        {
            let reached = reached.clone();
            cx.coroutine("early-exit", move |cx| {
                *reached.lock().expect("flag") = true;
                cx.exit_coroutine();
            });
        }
        assert!(*reached.lock().expect("flag"));
    });
}

#[test]
fn satisfy_covers_a_still_waiting_coroutine() {
    common::init();
    run_cotest("satisfy_covers_a_still_waiting_coroutine", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());

        {
            let turtle = turtle.clone();
            cx.coroutine("standby", move |cx| {
                cx.watch_call(&turtle.ink_check);
                // Deliberately open-ended: the test may finish while this
                // coroutine is still waiting.
                cx.satisfy();
                cx.wait_for_call(CallPattern::any()).return_void();
            });
        }

        cx.watch_call(CallPattern::any());
        let _l = cx.launch(move || painter.draw_dot());
        cx.wait_for_call(&turtle.pen_down).return_void();
        cx.wait_for_call(&turtle.pen_up).return_void();
        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}

#[test]
fn watch_owned_by_another_coroutine() {
    common::init();
    run_cotest("watch_owned_by_another_coroutine", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());

        let handler = {
            let turtle = turtle.clone();
            cx.coroutine("handler", move |cx| {
                cx.wait_for_call(&turtle.pen_down).return_void();
                cx.wait_for_call(&turtle.pen_up).return_void();
            })
        };
        // The watch is declared by main but owned by the handler coroutine.
        cx.watch_call_owned(&handler, CallPattern::any());

        let _l = cx.launch(move || painter.draw_dot());
        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}
