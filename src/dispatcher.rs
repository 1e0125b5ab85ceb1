//! A module for dispatcher.
//!
//! Maps a decoded [`Operation`] to a value or an application error.

use thiserror::Error;

use crate::protocol::Operation;

/// Failures a server reports inside a normal response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArithmeticError {
    /// Division with a zero divisor.
    #[error("Division by zero")]
    DivisionByZero,
    /// An operation that is not arithmetic, e.g. `EXT`.
    #[error("Invalid operation: {0}")]
    Unsupported(Operation),
}

/// A trait for the arithmetic backend of a server.
pub trait Dispatcher: Clone + Send + 'static {
    /// Compute `lhs <op> rhs`.
    fn dispatch(&self, op: Operation, lhs: f64, rhs: f64) -> Result<f64, ArithmeticError>;
}

/// The stock four-function calculator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Calculator;

impl Dispatcher for Calculator {
    fn dispatch(&self, op: Operation, lhs: f64, rhs: f64) -> Result<f64, ArithmeticError> {
        match op {
            Operation::Add => Ok(lhs + rhs),
            Operation::Subtract => Ok(lhs - rhs),
            Operation::Multiply => Ok(lhs * rhs),
            Operation::Divide if rhs == 0.0 => Err(ArithmeticError::DivisionByZero),
            Operation::Divide => Ok(lhs / rhs),
            Operation::Exit => Err(ArithmeticError::Unsupported(op)),
        }
    }
}
