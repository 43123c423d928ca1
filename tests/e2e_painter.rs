//! End-to-end scenarios on the painter/turtle fixtures: plain launches,
//! single and looped mock calls, typed returns, argument extraction.

mod common;

use common::{MockTurtle, MyClass, Painter};
use cotest::{run_cotest, CallPattern};

#[test]
fn plain_result() {
    common::init();
    run_cotest("plain_result", |cx| {
        let my = MyClass;
        let l = cx.launch(move || my.method1(24));
        let r = cx.wait_for_result();
        assert!(r.is_some());
        assert_eq!(r.value(&l), 72);
    });
}

#[test]
fn reference_argument_and_void_return() {
    common::init();
    run_cotest("reference_argument_and_void_return", |cx| {
        let shared = std::sync::Arc::new(std::sync::Mutex::new(24));
        let inner = shared.clone();
        let _l = cx.launch(move || {
            let my = MyClass;
            let mut guard = inner.lock().expect("lock");
            my.method2(&mut guard);
        });
        let r = cx.wait_for_result();
        assert!(r.is_some());
        assert_eq!(*shared.lock().expect("lock"), 72);
    });
}

#[test]
fn single_mock_call() {
    common::init();
    run_cotest("single_mock_call", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        cx.watch_call(CallPattern::any());

        let _l = cx.launch(move || painter.go_to_point_top_left());

        let c = cx.wait_for_call(CallPattern::any());
        assert!(c
            .is_call(turtle.go_to.where_args(|&(x, _)| x < 0))
            .is_some());
        assert!(c.is_call(turtle.go_to.with_args((-1, 1))).is_some());
        assert!(!c.is_call(&turtle.pen_up).is_some());
        c.return_void();
        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}

#[test]
fn watch_narrowed_to_one_method() {
    common::init();
    run_cotest("watch_narrowed_to_one_method", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        // Exterior filter on the watch itself; the wait then matches
        // whatever the watch lets through.
        cx.watch_call(turtle.go_to.where_args(|&(x, _)| x < 0));

        let _l = cx.launch(move || painter.go_to_point_top_left());
        cx.wait_for_call(CallPattern::any()).return_void();
        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}

#[test]
fn square_loop_in_order() {
    common::init();
    run_cotest("square_loop_in_order", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        cx.watch_call(CallPattern::any());

        let _l = cx.launch(move || painter.draw_square(5));
        cx.wait_for_call(&turtle.pen_down).return_void();
        for _ in 0..4 {
            cx.wait_for_call(turtle.forward.with_args((5,))).return_void();
            cx.wait_for_call(turtle.turn.with_args((90,))).return_void();
        }
        cx.wait_for_call(&turtle.pen_up).return_void();
        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}

#[test]
fn typed_return_drives_behavior() {
    common::init();
    run_cotest("typed_return_drives_behavior", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        cx.watch_call(CallPattern::any());

        // Far off the canvas: the painter must re-home.
        let l = cx.launch({
            let painter = painter.clone();
            move || painter.check_position()
        });
        cx.wait_for(&turtle.get_x).ret(-200);
        cx.wait_for_call(turtle.go_to.with_args((0, 0))).return_void();
        cx.wait_for_result_from(&l);

        // In bounds: every coordinate is interrogated, nothing moves.
        let l = cx.launch(move || painter.check_position());
        cx.wait_for(&turtle.get_x).ret(20);
        cx.wait_for(&turtle.get_x).ret(20);
        cx.wait_for(&turtle.get_y).ret(10);
        cx.wait_for(&turtle.get_y).ret(10);
        cx.wait_for_result_from(&l);
    });
}

#[test]
fn signature_handle_extracts_args() {
    common::init();
    run_cotest("signature_handle_extracts_args", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        cx.watch_call(CallPattern::any());

        let _l = cx.launch(move || painter.go_to_point_top_left());
        let c = cx.wait_for(&turtle.go_to);
        let (x, y) = c.args();
        assert_eq!(x * x + y * y, 2);
        c.ret(());
        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}

#[test]
fn erased_handle_arg_access() {
    common::init();
    run_cotest("erased_handle_arg_access", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        cx.watch_call(CallPattern::any());

        let _l = cx.launch(move || painter.draw_square(7));
        cx.wait_for_call(&turtle.pen_down).return_void();
        let c = cx.wait_for_call(&turtle.forward);
        assert_eq!(c.arg::<i32>(0), Some(7));
        assert_eq!(c.arg::<i32>(1), None);
        assert_eq!(c.arg::<String>(0), None);
        assert_eq!(c.method_name(), Some("forward"));
        c.return_void();
        for _ in 0..3 {
            cx.wait_for_call(&turtle.turn).return_void();
            cx.wait_for_call(&turtle.forward).return_void();
        }
        cx.wait_for_call(&turtle.turn).return_void();
        cx.wait_for_call(&turtle.pen_up).return_void();
        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}

#[test]
fn flexible_case_with_erased_checks() {
    common::init();
    run_cotest("flexible_case_with_erased_checks", |cx| {
        let turtle = MockTurtle::new(cx);
        let painter = Painter::new(turtle.clone());
        cx.watch_call(CallPattern::any());

        let _l = cx.launch(move || painter.draw_square(5));
        cx.wait_for_call(&turtle.pen_down).return_void();

        loop {
            let call = cx.wait_for_call(CallPattern::any());
            if !call.is_call(&turtle.forward).is_some() {
                // Leaving the loop on the first non-forward call.
                assert!(call.is_call(&turtle.pen_up).is_some());
                call.return_void();
                break;
            }
            assert!(call.is_call(turtle.forward.with_args((5,))).is_some());
            call.return_void();
            cx.wait_for_call(turtle.turn.with_args((90,))).return_void();
        }
        let r = cx.wait_for_result();
        assert!(r.is_some());
    });
}
