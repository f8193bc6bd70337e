mod linalg;
mod lsoda;
mod support;

pub use lsoda::{Lsoda, Options};
pub use support::{InterpError, ewset, fnorm, intdy, solsy, vmnorm};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Unit roundoff of IEEE double precision, as used by all floating-point
/// guards in the solver.
pub(crate) const ETA: f64 = 2.220_446_049_250_313_1e-16;

/// Any type implementing the `System` trait supplies the problem to the
/// integrator: the dimension, the right-hand side y' = f(t, y), an optional
/// dense Jacobian, and a sink for accepted-step samples.
pub trait System {
    /// Number of equations in the system.
    fn dimension(&self) -> usize;

    // Calculates the derivatives of y with respect to t.
    fn derive(
        &mut self,
        t: f64,
        y: &[f64],
        dy: &mut [f64],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Dense Jacobian J[i][j] = df_i/dy_j, written into `pd` using the
    /// solver's 1-based convention (row 0 and column 0 are unused).
    /// Only called when [`System::provides_jacobian`] returns true;
    /// otherwise the Jacobian is approximated by finite differences.
    fn jacobian(
        &mut self,
        _t: f64,
        _y: &[f64],
        _pd: &mut [Vec<f64>],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn provides_jacobian(&self) -> bool {
        false
    }

    // Receives one (t, y) sample per accepted internal step.
    fn solout(
        &mut self,
        _t: f64,
        _y: &[f64],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// The two multistep families the solver alternates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Method {
    /// Adams-Moulton, functional iteration, orders 1..=12. Non-stiff regime.
    Adams,
    /// Backward differentiation, chord iteration, orders 1..=5. Stiff regime.
    Bdf,
}

/// Possible error conditions that may arise during integration.
///
/// Illegal-input and interpolation errors leave the solver state untouched
/// and may be retried with corrected arguments. The remaining variants end
/// the current run: the best-effort solution is still available from the
/// instance, but the next call must restart with `istate = 1`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("illegal input: {param}")]
    IllegalInput { param: String },
    #[error("at t = {t}, {mxstep} steps taken on this call before reaching tout")]
    ExcessWork { t: f64, mxstep: i32 },
    #[error(
        "at t = {t}, too much accuracy requested for machine precision, suggested scaling factor = {tolsf}"
    )]
    ExcessAccuracy { t: f64, tolsf: f64 },
    #[error("at t = {t} and step size h = {h}, the error test failed repeatedly or with |h| = hmin")]
    RepeatedErrorTestFailures { t: f64, h: f64 },
    #[error(
        "at t = {t} and step size h = {h}, the corrector convergence failed repeatedly or with |h| = hmin"
    )]
    RepeatedConvergenceFailures { t: f64, h: f64 },
    #[error("at t = {t}, error weight component {index} became zero or negative")]
    ErrorWeightVanished { t: f64, index: usize },
    #[error("trouble from interpolation, itask = {itask}, tout = {tout}")]
    Interpolation { itask: i32, tout: f64 },
    #[error("Error in `derive`, `jacobian` or `solout` method")]
    External(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// The classic istate code the condition maps to. External callback
    /// failures have no code of their own and report as illegal input (-3).
    #[must_use]
    pub fn istate(&self) -> i32 {
        match self {
            Error::ExcessWork { .. } => -1,
            Error::ExcessAccuracy { .. } => -2,
            Error::IllegalInput { .. }
            | Error::Interpolation { .. }
            | Error::External(_) => -3,
            Error::RepeatedErrorTestFailures { .. } => -4,
            Error::RepeatedConvergenceFailures { .. } => -5,
            Error::ErrorWeightVanished { .. } => -6,
        }
    }
}

/// Contains some statistics of the integration.
#[derive(Debug, Default, Deserialize, Serialize, Copy, Clone)]
pub struct Stats {
    pub derivative_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub steps_taken: usize,
}

impl Display for Stats {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "derivative evaluations: {}, ", self.derivative_evaluations)?;
        write!(f, "jacobian evaluations: {}, ", self.jacobian_evaluations)?;
        write!(f, "steps taken: {}", self.steps_taken)?;

        Ok(())
    }
}
