//! Shared fixtures for the end-to-end tests: a plain CUT with no mocks, a
//! mocked turtle, and a painter driving it.

#![allow(dead_code)]

use cotest::{CoroCx, Mock, MockMethod};
use std::sync::Arc;

pub fn init() {
    cotest::test_utils::init_test_logging();
}

/// CUT without any mock collaborator.
pub struct MyClass;

impl MyClass {
    pub fn method1(&self, a: i32) -> i32 {
        a * 3
    }

    pub fn method2(&self, a: &mut i32) {
        *a *= 3;
    }
}

/// The collaborator interface the painter draws through.
pub trait Turtle: Send + Sync {
    fn pen_up(&self);
    fn pen_down(&self);
    fn forward(&self, distance: i32);
    fn turn(&self, degrees: i32);
    fn go_to(&self, x: i32, y: i32);
    fn get_x(&self) -> i32;
    fn get_y(&self) -> i32;
    fn ink_check(&self);
}

/// Hand-rolled mock turtle: one typed stub per method, forwarded through the
/// `Turtle` impl.
pub struct MockTurtle {
    pub pen_up: MockMethod<(), ()>,
    pub pen_down: MockMethod<(), ()>,
    pub forward: MockMethod<(i32,), ()>,
    pub turn: MockMethod<(i32,), ()>,
    pub go_to: MockMethod<(i32, i32), ()>,
    pub get_x: MockMethod<(), i32>,
    pub get_y: MockMethod<(), i32>,
    pub ink_check: MockMethod<(), ()>,
}

impl MockTurtle {
    pub fn new(cx: &CoroCx) -> Arc<Self> {
        let mock = Mock::new(cx, "Turtle");
        Arc::new(Self {
            pen_up: mock.method("pen_up"),
            pen_down: mock.method("pen_down"),
            forward: mock.method("forward"),
            turn: mock.method("turn"),
            go_to: mock.method("go_to"),
            get_x: mock.method("get_x"),
            get_y: mock.method("get_y"),
            ink_check: mock.method("ink_check"),
        })
    }
}

impl Turtle for MockTurtle {
    fn pen_up(&self) {
        self.pen_up.call(());
    }

    fn pen_down(&self) {
        self.pen_down.call(());
    }

    fn forward(&self, distance: i32) {
        self.forward.call((distance,));
    }

    fn turn(&self, degrees: i32) {
        self.turn.call((degrees,));
    }

    fn go_to(&self, x: i32, y: i32) {
        self.go_to.call((x, y));
    }

    fn get_x(&self) -> i32 {
        self.get_x.call(())
    }

    fn get_y(&self) -> i32 {
        self.get_y.call(())
    }

    fn ink_check(&self) {
        self.ink_check.call(());
    }
}

/// The code under test.
#[derive(Clone)]
pub struct Painter {
    turtle: Arc<dyn Turtle>,
}

impl Painter {
    pub fn new(turtle: Arc<dyn Turtle>) -> Self {
        Self { turtle }
    }

    pub fn empty_method(&self) {}

    pub fn draw_dot(&self) {
        self.turtle.pen_down();
        self.turtle.pen_up();
    }

    pub fn draw_square(&self, size: i32) {
        self.turtle.pen_down();
        for _ in 0..4 {
            self.turtle.forward(size);
            self.turtle.turn(90);
        }
        self.turtle.pen_up();
    }

    pub fn draw_square_ink_checks(&self, size: i32) {
        self.turtle.pen_down();
        for i in 0..4 {
            self.turtle.forward(size);
            self.turtle.turn(90);
            if i % 2 == 0 {
                self.turtle.ink_check();
            }
        }
        self.turtle.pen_up();
    }

    pub fn check_position(&self) {
        if self.turtle.get_x() < -100
            || self.turtle.get_x() > 100
            || self.turtle.get_y() < -100
            || self.turtle.get_y() > 100
        {
            self.turtle.go_to(0, 0);
        }
    }

    pub fn go_to_point_top_left(&self) {
        self.turtle.go_to(-1, 1);
    }
}
