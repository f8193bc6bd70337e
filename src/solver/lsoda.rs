use crate::solver::linalg::dgefa;
use crate::solver::support::{ewset, fnorm, intdy, solsy, vmnorm};
use crate::solver::{ETA, Error, Method, Stats, System};
use itertools::izip;
use log::{info, warn};
use serde::{Deserialize, Serialize};

// Adaptive multistep solver with automatic switching between the Adams
// and BDF families. The implementation keeps the classic 1-based array
// layout of the dense solver it descends from: element 0 of every work
// array is unused, and the Nordsieck history yh[j][i] holds the scaled
// j-1st derivative of component i.

/// Maximum order of the Adams method.
const MAX_ORD_ADAMS: usize = 12;
/// Maximum order of the BDF method.
const MAX_ORD_BDF: usize = 5;
/// Default step limit per call.
const MXSTP0: i32 = 500;
/// Default limit on t + h = t warnings.
const MXHNL0: i32 = 10;

/// Stability-region bounds of the Adams methods, indexed by order.
const SM1: [f64; 13] = [
    0., 0.5, 0.575, 0.55, 0.45, 0.35, 0.25, 0.2, 0.15, 0.1, 0.075, 0.05, 0.025,
];

/// Optional inputs, matching the classic optional-input block. A zero in
/// any integer field or `0.0` in a float field selects the built-in
/// default; negative values are rejected.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct Options {
    /// Print a message on each method switch (via the `log` facade).
    pub ixpr: i32,
    /// Maximum internal steps per call. Default 500.
    pub mxstep: i32,
    /// Maximum number of t + h = t warnings. Default 10.
    pub mxhnil: i32,
    /// Maximum order for the Adams method, capped at 12.
    pub mxordn: i32,
    /// Maximum order for the BDF method, capped at 5.
    pub mxords: i32,
    /// Step size to attempt on the first step. 0.0 means estimate it.
    pub h0: f64,
    /// Maximum absolute step size. 0.0 means unbounded.
    pub hmax: f64,
    /// Minimum absolute step size.
    pub hmin: f64,
}

/// The solver instance. Holds the full integration state between calls so
/// a run can be continued, retried with new tolerances, or inspected.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Lsoda {
    // construction-time configuration
    ml: usize,
    mu: usize,
    rtol_default: f64,
    atol_default: f64,
    mxordn_limit: usize,
    mxords_limit: usize,

    // continuation bookkeeping
    init: bool,
    istate: i32,
    illin: i32,
    ntrep: i32,
    nslast: usize,

    // optional inputs, resolved
    ixpr: i32,
    mxstep: i32,
    mxhnil: i32,
    mxordn: usize,
    mxords: usize,
    hmxi: f64,
    hmin: f64,
    nhnil: i32,

    // problem size and method selection
    n: usize,
    method: Method,
    mused: Method,
    miter: i32,
    jtyp: i32,
    maxord: usize,

    // step state
    t: f64,
    tn: f64,
    tsw: f64,
    h: f64,
    hu: f64,
    hold: f64,
    rc: f64,
    rmax: f64,
    jstart: i32,
    kflag: i32,
    nq: usize,
    nqu: usize,
    l: usize,
    lmax: usize,
    ialth: i32,
    ipup: i32,
    jcur: bool,
    nslp: usize,

    // corrector control
    el0: f64,
    conit: f64,
    conv_rate: f64,
    ccmax: f64,
    maxcor: usize,
    msbp: usize,
    mxncf: i32,
    ierpj: bool,

    // stiffness detection
    icount: i32,
    irflag: i32,
    pdest: f64,
    pdlast: f64,
    pdnorm: f64,
    ratio: f64,
    cm1: [f64; 13],
    cm2: [f64; 6],

    // method coefficients
    elco: Vec<Vec<f64>>,
    tesco: Vec<Vec<f64>>,
    el: [f64; 14],

    // work arrays, 1-based
    y: Vec<f64>,
    yh: Vec<Vec<f64>>,
    wm: Vec<Vec<f64>>,
    ewt: Vec<f64>,
    savf: Vec<f64>,
    acor: Vec<f64>,
    ipvt: Vec<usize>,

    // counters
    nfe: usize,
    nje: usize,
    nst: usize,
}

impl Default for Lsoda {
    fn default() -> Self {
        Self::new(0, 0, 1e-6, 1e-8, MAX_ORD_ADAMS, MAX_ORD_BDF)
    }
}

impl Lsoda {
    /// Create a solver. `ml` and `mu` are bandwidth hints for the Jacobian
    /// (0 for a full matrix), `rtol` and `atol` the default tolerances used
    /// by [`Lsoda::integrate`], and `mxordn`/`mxords` the order limits for
    /// the Adams and BDF families.
    #[must_use]
    pub fn new(ml: usize, mu: usize, rtol: f64, atol: f64, mxordn: usize, mxords: usize) -> Self {
        Self {
            ml,
            mu,
            rtol_default: rtol,
            atol_default: atol,
            mxordn_limit: mxordn.clamp(1, MAX_ORD_ADAMS),
            mxords_limit: mxords.clamp(1, MAX_ORD_BDF),
            init: false,
            istate: 0,
            illin: 0,
            ntrep: 0,
            nslast: 0,
            ixpr: 0,
            mxstep: MXSTP0,
            mxhnil: MXHNL0,
            mxordn: MAX_ORD_ADAMS,
            mxords: MAX_ORD_BDF,
            hmxi: 0.,
            hmin: 0.,
            nhnil: 0,
            n: 0,
            method: Method::Adams,
            mused: Method::Adams,
            miter: 0,
            jtyp: 2,
            maxord: MAX_ORD_ADAMS,
            t: 0.,
            tn: 0.,
            tsw: 0.,
            h: 0.,
            hu: 0.,
            hold: 0.,
            rc: 0.,
            rmax: 0.,
            jstart: 0,
            kflag: 0,
            nq: 0,
            nqu: 0,
            l: 0,
            lmax: 0,
            ialth: 0,
            ipup: 0,
            jcur: false,
            nslp: 0,
            el0: 0.,
            conit: 0.,
            conv_rate: 0.,
            ccmax: 0.,
            maxcor: 0,
            msbp: 0,
            mxncf: 0,
            ierpj: false,
            icount: 0,
            irflag: 0,
            pdest: 0.,
            pdlast: 0.,
            pdnorm: 0.,
            ratio: 0.,
            cm1: [0.; 13],
            cm2: [0.; 6],
            elco: vec![vec![0.; 14]; 13],
            tesco: vec![vec![0.; 4]; 13],
            el: [0.; 14],
            y: Vec::new(),
            yh: Vec::new(),
            wm: Vec::new(),
            ewt: Vec::new(),
            savf: Vec::new(),
            acor: Vec::new(),
            ipvt: Vec::new(),
            nfe: 0,
            nje: 0,
            nst: 0,
        }
    }

    /// The output time reached by the last successful call.
    #[must_use]
    pub fn t(&self) -> f64 {
        self.t
    }

    /// The internal time the solver has actually stepped to. Never behind
    /// interpolated output times.
    #[must_use]
    pub fn tn(&self) -> f64 {
        self.tn
    }

    /// Solution at [`Lsoda::t`], 0-based.
    #[must_use]
    pub fn y(&self) -> &[f64] {
        if self.y.is_empty() { &[] } else { &self.y[1..] }
    }

    /// Step size to be attempted on the next step.
    #[must_use]
    pub fn h(&self) -> f64 {
        self.h
    }

    /// Step size used on the last successful step.
    #[must_use]
    pub fn hu(&self) -> f64 {
        self.hu
    }

    /// Method family in use for the next step.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Time of the last method switch, or the initial time if none.
    #[must_use]
    pub fn tsw(&self) -> f64 {
        self.tsw
    }

    /// The istate value reported by the last call, or 0 before the first.
    #[must_use]
    pub fn istate(&self) -> i32 {
        self.istate
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        Stats {
            derivative_evaluations: self.nfe,
            jacobian_evaluations: self.nje,
            steps_taken: self.nst,
        }
    }

    /// Integrate from `t0` to `tout` with the construction-time default
    /// tolerances and return the solution at `tout`. Each call restarts
    /// the integration.
    pub fn integrate<S: System>(
        &mut self,
        system: &mut S,
        t0: f64,
        y0: &[f64],
        tout: f64,
    ) -> Result<Vec<f64>, Error> {
        let n = system.dimension();
        let rtol = [0., self.rtol_default];
        let atol = [0., self.atol_default];
        let _ = self.lsoda(system, n, y0, t0, tout, 1, &rtol, &atol, 1, 1, 0., None)?;
        Ok(self.y[1..=n].to_vec())
    }

    /// Full-control entry point.
    ///
    /// `y0` is the 0-based initial condition, read only when `istate = 1`.
    /// `rtol` and `atol` are 1-based; with a scalar `itol` mode only element
    /// 1 is read. `tcrit` is consulted for `itask` 4 and 5. On success the
    /// new istate (2) is returned and the solution is available via
    /// [`Lsoda::y`] and [`Lsoda::t`].
    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    pub fn lsoda<S: System>(
        &mut self,
        system: &mut S,
        neq: usize,
        y0: &[f64],
        t: f64,
        tout: f64,
        itol: i32,
        rtol: &[f64],
        atol: &[f64],
        itask: i32,
        istate: i32,
        tcrit: f64,
        opts: Option<&Options>,
    ) -> Result<i32, Error> {
        // Block a: legality of istate and itask, first-call detection.
        if !(1..=3).contains(&istate) {
            return self.illegal(format!("istate = {istate}"));
        }
        if !(1..=5).contains(&itask) {
            return self.illegal(format!("itask = {itask}"));
        }
        if !self.init && istate > 1 {
            return self.illegal(format!("istate = {istate}, but the solver is not initialized"));
        }
        if istate == 1 {
            self.init = false;
            if tout == t {
                self.ntrep += 1;
                if self.ntrep < 5 {
                    return Ok(istate);
                }
                return self.illegal("repeated calls with istate = 1 and tout = t".to_string());
            }
        }

        // Tolerance layout is consulted on every call, so validate it for
        // every istate.
        if !(1..=4).contains(&itol) {
            return self.illegal(format!("itol = {itol}"));
        }
        let need_rtol = if itol >= 3 { neq + 1 } else { 2 };
        let need_atol = if itol == 2 || itol == 4 { neq + 1 } else { 2 };
        if rtol.len() < need_rtol || atol.len() < need_atol {
            return self.illegal("tolerance array shorter than itol requires".to_string());
        }

        let mut h0 = 0.;

        // Block b: inputs examined on initialization and on parameter
        // changes (istate 1 or 3).
        if istate == 1 || istate == 3 {
            self.ntrep = 0;
            if neq == 0 {
                return self.illegal("neq = 0".to_string());
            }
            if istate == 1 {
                if neq != system.dimension() {
                    return self.illegal(format!(
                        "neq = {neq} differs from the system dimension {}",
                        system.dimension()
                    ));
                }
                if y0.len() < neq {
                    return self.illegal(format!(
                        "initial condition has {} components, neq = {neq}",
                        y0.len()
                    ));
                }
                if (self.ml != 0 || self.mu != 0) && (self.ml >= neq || self.mu >= neq) {
                    return self.illegal(format!(
                        "bandwidths ml = {}, mu = {} out of range for neq = {neq}",
                        self.ml, self.mu
                    ));
                }
            }
            if istate == 3 && neq > self.n {
                return self.illegal(format!(
                    "istate = 3 and neq increased from {} to {neq}",
                    self.n
                ));
            }
            self.n = neq;

            let mut rtoli = rtol[1];
            let mut atoli = atol[1];
            for i in 1..=self.n {
                if itol >= 3 {
                    rtoli = rtol[i];
                }
                if itol == 2 || itol == 4 {
                    atoli = atol[i];
                }
                if rtoli < 0. {
                    return self.illegal(format!("rtol = {rtoli} is less than 0"));
                }
                if atoli < 0. {
                    return self.illegal(format!("atol = {atoli} is less than 0"));
                }
            }

            // optional inputs
            if let Some(o) = opts {
                if o.ixpr < 0 || o.ixpr > 1 {
                    return self.illegal(format!("ixpr = {}", o.ixpr));
                }
                self.ixpr = o.ixpr;
                if o.mxstep < 0 {
                    return self.illegal(format!("mxstep = {}", o.mxstep));
                }
                self.mxstep = if o.mxstep == 0 { MXSTP0 } else { o.mxstep };
                if o.mxhnil < 0 {
                    return self.illegal(format!("mxhnil = {}", o.mxhnil));
                }
                self.mxhnil = if o.mxhnil == 0 { MXHNL0 } else { o.mxhnil };
                if o.mxordn < 0 {
                    return self.illegal(format!("mxordn = {}", o.mxordn));
                }
                #[allow(clippy::cast_sign_loss)]
                let mxordn = if o.mxordn == 0 {
                    self.mxordn_limit
                } else {
                    o.mxordn as usize
                };
                self.mxordn = mxordn.min(self.mxordn_limit);
                if o.mxords < 0 {
                    return self.illegal(format!("mxords = {}", o.mxords));
                }
                #[allow(clippy::cast_sign_loss)]
                let mxords = if o.mxords == 0 {
                    self.mxords_limit
                } else {
                    o.mxords as usize
                };
                self.mxords = mxords.min(self.mxords_limit);
                if istate == 1 {
                    h0 = o.h0;
                    if (tout - t) * h0 < 0. {
                        return self.illegal("tout behind t, integration direction is given by h0"
                            .to_string());
                    }
                }
                if o.hmax < 0. {
                    return self.illegal(format!("hmax = {}", o.hmax));
                }
                self.hmxi = if o.hmax > 0. { 1. / o.hmax } else { 0. };
                if o.hmin < 0. {
                    return self.illegal(format!("hmin = {}", o.hmin));
                }
                self.hmin = o.hmin;
            } else {
                self.ixpr = 0;
                self.mxstep = MXSTP0;
                self.mxhnil = MXHNL0;
                self.hmxi = 0.;
                self.hmin = 0.;
                self.mxordn = self.mxordn_limit;
                self.mxords = self.mxords_limit;
            }

            if istate == 3 {
                // New order limits bind the family in use right away; the
                // next step entry reduces nq if it now sits above maxord.
                self.maxord = match self.method {
                    Method::Adams => self.mxordn,
                    Method::Bdf => self.mxords,
                };
                self.jstart = -1;
            }
        }

        // Block c: remaining work for the start of the problem, including
        // the initial derivative evaluation and step-size estimate.
        if istate == 1 {
            self.tn = t;
            self.t = t;
            self.tsw = t;
            self.maxord = self.mxordn;
            if itask == 4 || itask == 5 {
                if (tcrit - tout) * (tout - t) < 0. {
                    return self
                        .illegal("itask = 4 or 5 and tcrit is behind tout".to_string());
                }
                if h0 != 0. && (t + h0 - tcrit) * h0 > 0. {
                    h0 = tcrit - t;
                }
            }
            self.jstart = 0;
            self.nhnil = 0;
            self.nst = 0;
            self.nje = 0;
            self.nslast = 0;
            self.hu = 0.;
            self.nqu = 0;
            self.method = Method::Adams;
            self.mused = Method::Adams;
            self.miter = 0;
            self.jtyp = if system.provides_jacobian() { 1 } else { 2 };
            self.ccmax = 0.3;
            self.maxcor = 3;
            self.msbp = 20;
            self.mxncf = 10;

            let lenyh = 1 + self.mxordn.max(self.mxords);
            self.yh = vec![vec![0.; self.n + 1]; lenyh + 1];
            self.wm = vec![vec![0.; self.n + 1]; self.n + 1];
            self.ewt = vec![0.; self.n + 1];
            self.savf = vec![0.; self.n + 1];
            self.acor = vec![0.; self.n + 1];
            self.ipvt = vec![0; self.n + 1];
            self.y = vec![0.; self.n + 1];
            for i in 1..=self.n {
                self.y[i] = y0[i - 1];
            }

            system.derive(t, &self.y[1..], &mut self.yh[2][1..])?;
            self.nfe = 1;
            self.yh[1][1..].copy_from_slice(&self.y[1..]);
            self.nq = 1;
            self.h = 1.;

            let w = ewset(&self.y, itol, rtol, atol, self.n);
            for i in 1..=self.n {
                if w[i] <= 0. {
                    self.istate = -6;
                    self.terminate2();
                    return Err(Error::ErrorWeightVanished { t: self.tn, index: i });
                }
                self.ewt[i] = 1. / w[i];
            }

            // Estimate h0 if not given: a weighted geometric mean of the
            // interval scale and the scale set by the initial derivative.
            if h0 == 0. {
                let tdist = (tout - t).abs();
                let w0 = t.abs().max(tout.abs());
                if tdist < 2. * ETA * w0 {
                    return self
                        .illegal("tout too close to t to start integration".to_string());
                }
                let mut tol = rtol[1];
                if itol > 2 {
                    for i in 2..=self.n {
                        tol = tol.max(rtol[i]);
                    }
                }
                if tol <= 0. {
                    let mut atoli = atol[1];
                    for i in 1..=self.n {
                        if itol == 2 || itol == 4 {
                            atoli = atol[i];
                        }
                        let ayi = self.y[i].abs();
                        if ayi != 0. {
                            tol = tol.max(atoli / ayi);
                        }
                    }
                }
                tol = tol.max(100. * ETA).min(0.001);
                let sum = vmnorm(self.n, &self.yh[2], &self.ewt);
                let sum = 1. / (tol * w0 * w0) + tol * sum * sum;
                h0 = 1. / sum.sqrt();
                h0 = h0.min(tdist);
                if tout - t < 0. {
                    h0 = -h0;
                }
            }
            let rh = h0.abs() * self.hmxi;
            if rh > 1. {
                h0 /= rh;
            }
            self.h = h0;
            for i in 1..=self.n {
                self.yh[2][i] *= h0;
            }

            system.solout(self.tn, &self.yh[1][1..])?;
        }

        // Block d: continuation calls only. Dispatch on itask before
        // taking further steps; tout may already be within reach.
        let mut ihit = false;
        if istate == 2 || istate == 3 {
            self.nslast = self.nst;
            match itask {
                1 => {
                    if (self.tn - tout) * self.h >= 0. {
                        return self.interpolated_return(itask, tout);
                    }
                }
                3 => {
                    let tp = self.tn - self.hu * (1. + 100. * ETA);
                    if (tp - tout) * self.h > 0. {
                        return self.illegal(format!(
                            "itask = {itask} and tout = {tout} behind tcur - hu"
                        ));
                    }
                    if (self.tn - tout) * self.h >= 0. {
                        return Ok(self.success_return(itask, ihit, tcrit));
                    }
                }
                4 => {
                    if (self.tn - tcrit) * self.h > 0. {
                        return self
                            .illegal("itask = 4 or 5 and tcrit is behind tcur".to_string());
                    }
                    if (tcrit - tout) * self.h < 0. {
                        return self
                            .illegal("itask = 4 or 5 and tcrit is behind tout".to_string());
                    }
                    if (self.tn - tout) * self.h >= 0. {
                        return self.interpolated_return(itask, tout);
                    }
                }
                5 => {
                    if (self.tn - tcrit) * self.h > 0. {
                        return self
                            .illegal("itask = 4 or 5 and tcrit is behind tcur".to_string());
                    }
                }
                _ => {}
            }
            if itask == 4 || itask == 5 {
                let hmx = self.tn.abs() + self.h.abs();
                ihit = (self.tn - tcrit).abs() <= 100. * ETA * hmx;
                if ihit {
                    return Ok(self.success_return(itask, ihit, tcrit));
                }
                let tnext = self.tn + self.h * (1. + 4. * ETA);
                if (tnext - tcrit) * self.h > 0. {
                    self.h = (tcrit - self.tn) * (1. - 4. * ETA);
                    if istate == 2 {
                        self.jstart = -2;
                    }
                }
            }
        }

        // Block e: the step loop. Each pass checks the step and accuracy
        // budgets, refreshes the error weights, takes one step, and hands
        // the outcome to block f.
        loop {
            if istate != 1 || self.nst != 0 {
                #[allow(clippy::cast_sign_loss)]
                if self.nst - self.nslast >= self.mxstep as usize {
                    self.istate = -1;
                    self.terminate2();
                    return Err(Error::ExcessWork { t: self.tn, mxstep: self.mxstep });
                }
                let w = ewset(&self.yh[1], itol, rtol, atol, self.n);
                for i in 1..=self.n {
                    if w[i] <= 0. {
                        self.istate = -6;
                        self.terminate2();
                        return Err(Error::ErrorWeightVanished { t: self.tn, index: i });
                    }
                    self.ewt[i] = 1. / w[i];
                }
            }
            let tolsf = ETA * vmnorm(self.n, &self.yh[1], &self.ewt);
            if tolsf > 0.01 {
                let tolsf = tolsf * 200.;
                if self.nst == 0 {
                    return self.illegal(format!(
                        "at start of problem, too much accuracy requested for precision of \
                         machine, suggested scaling factor = {tolsf}"
                    ));
                }
                self.istate = -2;
                self.terminate2();
                return Err(Error::ExcessAccuracy { t: self.tn, tolsf });
            }
            if self.tn + self.h == self.tn {
                self.nhnil += 1;
                if self.nhnil <= self.mxhnil {
                    warn!(
                        "internal t = {} and h = {} are such that t + h = t on the next step",
                        self.tn, self.h
                    );
                    if self.nhnil == self.mxhnil {
                        warn!("the above warning will not be issued again for this problem");
                    }
                }
            }

            self.advance(system)?;

            if self.kflag == 0 {
                // Block f: successful step.
                self.init = true;
                if self.method != self.mused {
                    self.tsw = self.tn;
                    self.maxord = match self.method {
                        Method::Adams => self.mxordn,
                        Method::Bdf => self.mxords,
                    };
                    self.jstart = -1;
                    if self.ixpr != 0 {
                        match self.method {
                            Method::Bdf => info!("a switch to the stiff method has occurred"),
                            Method::Adams => {
                                info!("a switch to the nonstiff method has occurred");
                            }
                        }
                        info!(
                            "at t = {}, tentative step size h = {}, step nst = {}",
                            self.tn, self.h, self.nst
                        );
                    }
                }
                system.solout(self.tn, &self.yh[1][1..])?;

                if itask == 1 {
                    if (self.tn - tout) * self.h < 0. {
                        continue;
                    }
                    return self.interpolated_return(itask, tout);
                }
                if itask == 2 {
                    return Ok(self.success_return(itask, ihit, tcrit));
                }
                if itask == 3 {
                    if (self.tn - tout) * self.h >= 0. {
                        return Ok(self.success_return(itask, ihit, tcrit));
                    }
                    continue;
                }
                if itask == 4 {
                    if (self.tn - tout) * self.h >= 0. {
                        return self.interpolated_return(itask, tout);
                    }
                    let hmx = self.tn.abs() + self.h.abs();
                    ihit = (self.tn - tcrit).abs() <= 100. * ETA * hmx;
                    if ihit {
                        return Ok(self.success_return(itask, ihit, tcrit));
                    }
                    let tnext = self.tn + self.h * (1. + 4. * ETA);
                    if (tnext - tcrit) * self.h <= 0. {
                        continue;
                    }
                    self.h = (tcrit - self.tn) * (1. - 4. * ETA);
                    self.jstart = -2;
                    continue;
                }
                // itask == 5
                let hmx = self.tn.abs() + self.h.abs();
                ihit = (self.tn - tcrit).abs() <= 100. * ETA * hmx;
                return Ok(self.success_return(itask, ihit, tcrit));
            }

            // Block g: unrecoverable step failure.
            if self.kflag == -1 {
                self.istate = -4;
                self.terminate2();
                return Err(Error::RepeatedErrorTestFailures { t: self.tn, h: self.h });
            }
            self.istate = -5;
            self.terminate2();
            return Err(Error::RepeatedConvergenceFailures { t: self.tn, h: self.h });
        }
    }

    fn illegal(&mut self, param: String) -> Result<i32, Error> {
        if self.illin == 5 {
            return Err(Error::IllegalInput {
                param: "repeated occurrences of illegal input, run aborted".to_string(),
            });
        }
        self.illin += 1;
        self.istate = -3;
        Err(Error::IllegalInput { param })
    }

    fn terminate2(&mut self) {
        for i in 1..=self.n {
            self.y[i] = self.yh[1][i];
        }
        self.t = self.tn;
        self.illin = 0;
    }

    fn success_return(&mut self, itask: i32, ihit: bool, tcrit: f64) -> i32 {
        for i in 1..=self.n {
            self.y[i] = self.yh[1][i];
        }
        self.t = self.tn;
        if (itask == 4 || itask == 5) && ihit {
            self.t = tcrit;
        }
        self.istate = 2;
        self.illin = 0;
        2
    }

    fn interpolated_return(&mut self, itask: i32, tout: f64) -> Result<i32, Error> {
        match intdy(tout, 0, &self.yh, self.n, self.nq, self.tn, self.h, self.hu) {
            Ok(dky) => {
                self.y[1..].copy_from_slice(&dky[1..]);
                self.t = tout;
                self.istate = 2;
                self.illin = 0;
                Ok(2)
            }
            Err(_) => {
                self.istate = -3;
                Err(Error::Interpolation { itask, tout })
            }
        }
    }

    /// Take one internal step. On return `kflag` is 0 for success, -1
    /// after repeated error-test failures and -2 after repeated corrector
    /// failures, both with |h| at its minimum.
    #[allow(clippy::too_many_lines)]
    fn advance<S: System>(&mut self, system: &mut S) -> Result<(), Error> {
        self.kflag = 0;
        let told = self.tn;
        let mut ncf = 0;
        self.ierpj = false;
        self.jcur = false;
        let mut del = 0.;
        let mut delp = 0.;
        let mut m = 0;
        let mut rh;
        let mut pdh = 0.;
        let mut pnorm;

        if self.jstart == 0 {
            // First step of the problem: order 1, Adams, and the switching
            // constants cm1/cm2 for both families.
            self.lmax = self.maxord + 1;
            self.nq = 1;
            self.l = 2;
            self.ialth = 2;
            self.rmax = 10000.;
            self.rc = 0.;
            self.el0 = 1.;
            self.conv_rate = 0.7;
            self.hold = self.h;
            self.nslp = 0;
            self.ipup = self.miter;
            self.icount = 20;
            self.irflag = 0;
            self.pdest = 0.;
            self.pdlast = 0.;
            self.ratio = 5.;
            self.compute_coefficients(Method::Bdf);
            for i in 1..=MAX_ORD_BDF {
                self.cm2[i] = self.tesco[i][2] * self.elco[i][i + 1];
            }
            self.compute_coefficients(Method::Adams);
            for i in 1..=MAX_ORD_ADAMS {
                self.cm1[i] = self.tesco[i][2] * self.elco[i][i + 1];
            }
            self.reset_coefficients();
        }
        if self.jstart == -1 {
            self.ipup = self.miter;
            self.lmax = self.maxord + 1;
            if self.ialth == 1 {
                self.ialth = 2;
            }
            if self.method != self.mused {
                self.compute_coefficients(self.method);
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                {
                    self.ialth = self.l as i32;
                }
                self.reset_coefficients();
            }
            if self.nq > self.maxord {
                // The caller lowered the order limit below the current
                // order: drop to the highest order still allowed and let
                // the error estimate of the last step pick the new h.
                self.nq = self.maxord;
                self.l = self.lmax;
                self.reset_coefficients();
                let ddn = vmnorm(self.n, &self.acor, &self.ewt) / self.tesco[self.nq][1];
                #[allow(clippy::cast_precision_loss)]
                let exdn = 1. / self.l as f64;
                rh = (1. / (1.3 * ddn.powf(exdn) + 0.0000013)).min(1.);
                if self.h == self.hold {
                    rh = rh.max(self.hmin / self.h.abs());
                } else {
                    rh = rh.min((self.h / self.hold).abs());
                    self.h = self.hold;
                }
                self.rescale_history(&mut rh, &mut pdh);
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                {
                    self.ialth = self.l as i32;
                }
            } else if self.h != self.hold {
                rh = self.h / self.hold;
                self.h = self.hold;
                self.rescale_history(&mut rh, &mut pdh);
            }
        }
        if self.jstart == -2 && self.h != self.hold {
            rh = self.h / self.hold;
            self.h = self.hold;
            self.rescale_history(&mut rh, &mut pdh);
        }

        loop {
            loop {
                if (self.rc - 1.).abs() > self.ccmax {
                    self.ipup = self.miter;
                }
                if self.nst >= self.nslp + self.msbp {
                    self.ipup = self.miter;
                }
                self.tn += self.h;

                // Predict by accumulating the Pascal-triangle sums over
                // the history array.
                for j in (1..=self.nq).rev() {
                    for i1 in j..=self.nq {
                        let (head, tail) = self.yh.split_at_mut(i1 + 1);
                        for (u, &v) in izip!(&mut head[i1][1..], &tail[0][1..]) {
                            *u += v;
                        }
                    }
                }
                pnorm = vmnorm(self.n, &self.yh[1], &self.ewt);

                let corflag = self.correct(
                    system, pnorm, &mut del, &mut delp, told, &mut ncf, &mut m,
                )?;
                match corflag {
                    0 => break,
                    1 => {
                        rh = 0.25_f64.max(self.hmin / self.h.abs());
                        self.rescale_history(&mut rh, &mut pdh);
                        continue;
                    }
                    _ => {
                        self.kflag = -2;
                        self.hold = self.h;
                        self.jstart = 1;
                        return Ok(());
                    }
                }
            }

            // The corrector converged; run the local error test.
            self.jcur = false;
            let dsm = if m == 0 {
                del / self.tesco[self.nq][2]
            } else {
                vmnorm(self.n, &self.acor, &self.ewt) / self.tesco[self.nq][2]
            };

            if dsm <= 1. {
                // Step accepted. Update the history, then consider a
                // method switch and a step/order change.
                self.kflag = 0;
                self.nst += 1;
                self.hu = self.h;
                self.nqu = self.nq;
                self.mused = self.method;
                for j in 1..=self.l {
                    let r = self.el[j];
                    for (u, &a) in izip!(&mut self.yh[j][1..], &self.acor[1..]) {
                        *u += r * a;
                    }
                }
                self.icount -= 1;
                if self.icount < 0 {
                    let mut rh_sw = 0.;
                    self.consider_method_switch(dsm, pnorm, &mut pdh, &mut rh_sw);
                    if self.method != self.mused {
                        rh = rh_sw.max(self.hmin / self.h.abs());
                        self.rescale_history(&mut rh, &mut pdh);
                        self.rmax = 10.;
                        self.finish_step();
                        break;
                    }
                }
                // In any case, reconsider the order after ialth more
                // steps at the current one.
                self.ialth -= 1;
                if self.ialth == 0 {
                    let mut rhup = 0.;
                    if self.l != self.lmax {
                        for i in 1..=self.n {
                            self.savf[i] = self.acor[i] - self.yh[self.lmax][i];
                        }
                        let dup =
                            vmnorm(self.n, &self.savf, &self.ewt) / self.tesco[self.nq][3];
                        #[allow(clippy::cast_precision_loss)]
                        let exup = 1. / (self.l + 1) as f64;
                        rhup = 1. / (1.4 * dup.powf(exup) + 0.0000014);
                    }
                    let (orderflag, mut rh2) = self.select_order(&mut rhup, dsm, &mut pdh);
                    if orderflag == 0 {
                        self.finish_step();
                        break;
                    }
                    if orderflag == 2 {
                        self.reset_coefficients();
                    }
                    rh2 = rh2.max(self.hmin / self.h.abs());
                    self.rescale_history(&mut rh2, &mut pdh);
                    self.rmax = 10.;
                    self.finish_step();
                    break;
                }
                if self.ialth > 1 || self.l == self.lmax {
                    self.finish_step();
                    break;
                }
                self.yh[self.lmax][1..].copy_from_slice(&self.acor[1..]);
                self.finish_step();
                break;
            }

            // The error test failed: restore tn and the history, cut h,
            // possibly drop the order, and retry.
            self.kflag -= 1;
            self.tn = told;
            for j in (1..=self.nq).rev() {
                for i1 in j..=self.nq {
                    let (head, tail) = self.yh.split_at_mut(i1 + 1);
                    for (u, &v) in izip!(&mut head[i1][1..], &tail[0][1..]) {
                        *u -= v;
                    }
                }
            }
            self.rmax = 2.;
            if self.h.abs() <= self.hmin * 1.00001 {
                self.kflag = -1;
                self.hold = self.h;
                self.jstart = 1;
                break;
            }
            if self.kflag > -3 {
                let mut rhup = 0.;
                let (orderflag, mut rh2) = self.select_order(&mut rhup, dsm, &mut pdh);
                if orderflag == 0 {
                    rh2 = rh2.min(0.2);
                }
                if orderflag == 2 {
                    self.reset_coefficients();
                }
                rh2 = rh2.max(self.hmin / self.h.abs());
                self.rescale_history(&mut rh2, &mut pdh);
                continue;
            }
            // Three or more failures: the derivative in yh may be wrong.
            // Reload it, fall back to order 1, and cut h by a factor 10.
            if self.kflag == -10 && self.h.abs() <= self.hmin * 1.00001 {
                self.kflag = -1;
                self.hold = self.h;
                self.jstart = 1;
                break;
            }
            rh = 0.1_f64.max(self.hmin / self.h.abs());
            self.h *= rh;
            self.y[1..].copy_from_slice(&self.yh[1][1..]);
            system.derive(self.tn, &self.y[1..], &mut self.savf[1..])?;
            self.nfe += 1;
            for i in 1..=self.n {
                self.yh[2][i] = self.h * self.savf[i];
            }
            self.ipup = self.miter;
            self.ialth = 5;
            if self.nq > 1 {
                self.nq = 1;
                self.l = 2;
                self.reset_coefficients();
            }
        }
        Ok(())
    }

    fn finish_step(&mut self) {
        let r = 1. / self.tesco[self.nqu][2];
        for i in 1..=self.n {
            self.acor[i] *= r;
        }
        self.hold = self.h;
        self.jstart = 1;
    }

    /// Run the corrector iteration at the predicted point. Returns 0 on
    /// convergence, 1 when the step should be retried with a smaller h,
    /// and 2 when the failure is final for this step.
    #[allow(clippy::too_many_arguments)]
    fn correct<S: System>(
        &mut self,
        system: &mut S,
        pnorm: f64,
        del: &mut f64,
        delp: &mut f64,
        told: f64,
        ncf: &mut i32,
        m: &mut usize,
    ) -> Result<i32, Error> {
        *m = 0;
        let mut rate: f64 = 0.;
        *del = 0.;
        self.y[1..].copy_from_slice(&self.yh[1][1..]);
        system.derive(self.tn, &self.y[1..], &mut self.savf[1..])?;
        self.nfe += 1;

        loop {
            if *m == 0 {
                if self.ipup > 0 {
                    // The iteration matrix is stale; rebuild and refactor.
                    self.form_iteration_matrix(system)?;
                    self.ipup = 0;
                    self.rc = 1.;
                    self.nslp = self.nst;
                    self.conv_rate = 0.7;
                    if self.ierpj {
                        return Ok(self.corrector_failure(told, ncf));
                    }
                }
                for i in 1..=self.n {
                    self.acor[i] = 0.;
                }
            }
            if self.miter == 0 {
                // Functional iteration: correct y directly.
                for i in 1..=self.n {
                    self.savf[i] = self.h * self.savf[i] - self.yh[2][i];
                    self.y[i] = self.savf[i] - self.acor[i];
                }
                *del = vmnorm(self.n, &self.y, &self.ewt);
                for i in 1..=self.n {
                    self.y[i] = self.yh[1][i] + self.el[1] * self.savf[i];
                    self.acor[i] = self.savf[i];
                }
            } else {
                // Chord iteration: solve the linear system against the
                // cached LU factors.
                for i in 1..=self.n {
                    self.y[i] = self.h * self.savf[i] - (self.yh[2][i] + self.acor[i]);
                }
                solsy(&mut self.y, &self.wm, self.n, &self.ipvt, self.miter);
                *del = vmnorm(self.n, &self.y, &self.ewt);
                for i in 1..=self.n {
                    self.acor[i] += self.y[i];
                    self.y[i] = self.yh[1][i] + self.el[1] * self.acor[i];
                }
            }

            if *del <= 100. * pnorm * ETA {
                return Ok(0);
            }
            if *m != 0 || self.method != Method::Adams {
                if *m != 0 {
                    let mut rm = 1024.;
                    if *del <= 1024. * *delp {
                        rm = *del / *delp;
                    }
                    rate = rate.max(rm);
                    self.conv_rate = (0.2 * self.conv_rate).max(rm);
                }
                let dcon =
                    *del * 1.0_f64.min(1.5 * self.conv_rate) / (self.tesco[self.nq][2] * self.conit);
                if dcon <= 1. {
                    self.pdest = self.pdest.max(rate / (self.h * self.el[1]).abs());
                    if self.pdest != 0. {
                        self.pdlast = self.pdest;
                    }
                    return Ok(0);
                }
            }
            *m += 1;
            if *m == self.maxcor || (*m >= 2 && *del > 2. * *delp) {
                if self.miter == 0 || self.jcur {
                    return Ok(self.corrector_failure(told, ncf));
                }
                // Retry with a fresh Jacobian before giving up on h.
                self.ipup = self.miter;
                *m = 0;
                rate = 0.;
                *del = 0.;
                self.y[1..].copy_from_slice(&self.yh[1][1..]);
                system.derive(self.tn, &self.y[1..], &mut self.savf[1..])?;
                self.nfe += 1;
            } else {
                *delp = *del;
                system.derive(self.tn, &self.y[1..], &mut self.savf[1..])?;
                self.nfe += 1;
            }
        }
    }

    fn corrector_failure(&mut self, told: f64, ncf: &mut i32) -> i32 {
        *ncf += 1;
        self.rmax = 2.;
        self.tn = told;
        for j in (1..=self.nq).rev() {
            for i1 in j..=self.nq {
                let (head, tail) = self.yh.split_at_mut(i1 + 1);
                for (u, &v) in izip!(&mut head[i1][1..], &tail[0][1..]) {
                    *u -= v;
                }
            }
        }
        if self.h.abs() <= self.hmin * 1.00001 || *ncf == self.mxncf {
            return 2;
        }
        self.ipup = self.miter;
        1
    }

    /// Build and LU-factor the iteration matrix P = I - h*el0*J, either
    /// from the user-supplied Jacobian (miter 1) or by forward differences
    /// on the right-hand side (miter 2).
    fn form_iteration_matrix<S: System>(&mut self, system: &mut S) -> Result<(), Error> {
        self.nje += 1;
        self.ierpj = false;
        self.jcur = true;
        let hl0 = self.h * self.el0;

        if self.miter == 1 {
            system.jacobian(self.tn, &self.y[1..], &mut self.wm)?;
            for i in 1..=self.n {
                for j in 1..=self.n {
                    self.wm[i][j] *= -hl0;
                }
            }
        } else {
            // Column-wise forward differences with per-component
            // increments safeguarded against zero.
            let fac = vmnorm(self.n, &self.savf, &self.ewt);
            #[allow(clippy::cast_precision_loss)]
            let mut r0 = 1000. * self.h.abs() * ETA * (self.n as f64) * fac;
            if r0 == 0. {
                r0 = 1.;
            }
            let sqrteta = ETA.sqrt();
            for j in 1..=self.n {
                let yj = self.y[j];
                let r = (sqrteta * yj.abs()).max(r0 / self.ewt[j]);
                self.y[j] += r;
                let fac = -hl0 / r;
                system.derive(self.tn, &self.y[1..], &mut self.acor[1..])?;
                for i in 1..=self.n {
                    self.wm[i][j] = (self.acor[i] - self.savf[i]) * fac;
                }
                self.y[j] = yj;
            }
            self.nfe += self.n;
        }

        // Spectral-radius estimate for the stiffness switch, then form P.
        self.pdnorm = fnorm(self.n, &self.wm, &self.ewt) / hl0.abs();
        for i in 1..=self.n {
            self.wm[i][i] += 1.;
        }
        if dgefa(&mut self.wm, self.n, &mut self.ipvt) != 0 {
            self.ierpj = true;
        }
        Ok(())
    }

    /// Rescale h by `rh`, bounded by `rmax`, hmax and (for Adams) the
    /// stability region, and rescale the history array to match.
    fn rescale_history(&mut self, rh: &mut f64, pdh: &mut f64) {
        *rh = rh.min(self.rmax);
        *rh /= 1.0_f64.max(self.h.abs() * self.hmxi * *rh);
        if self.method == Method::Adams {
            self.irflag = 0;
            *pdh = (self.h.abs() * self.pdlast).max(0.000001);
            if *rh * *pdh * 1.00001 >= SM1[self.nq] {
                *rh = SM1[self.nq] / *pdh;
                self.irflag = 1;
            }
        }
        let mut r = 1.;
        for j in 2..=self.l {
            r *= *rh;
            for i in 1..=self.n {
                self.yh[j][i] *= r;
            }
        }
        self.h *= *rh;
        self.rc *= *rh;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        {
            self.ialth = self.l as i32;
        }
    }

    /// Fill elco and tesco for all orders of the given method family.
    /// elco[nq] holds the corrector coefficients at order nq, tesco[nq]
    /// the test constants for order nq-1, nq and nq+1 selection.
    #[allow(clippy::cast_precision_loss)]
    fn compute_coefficients(&mut self, method: Method) {
        let mut pc = [0.; 13];
        match method {
            Method::Adams => {
                self.elco[1][1] = 1.;
                self.elco[1][2] = 1.;
                self.tesco[1][1] = 0.;
                self.tesco[1][2] = 2.;
                self.tesco[2][1] = 1.;
                self.tesco[12][3] = 0.;
                pc[1] = 1.;
                let mut rqfac = 1.;
                for nq in 2..=MAX_ORD_ADAMS {
                    // pc becomes the product (x+1)(x+2)...(x+nq-1)
                    let rq1fac = rqfac;
                    rqfac /= nq as f64;
                    let nqm1 = nq - 1;
                    let fnqm1 = nqm1 as f64;
                    pc[nq] = 0.;
                    for i in (2..=nq).rev() {
                        pc[i] = pc[i - 1] + fnqm1 * pc[i];
                    }
                    pc[1] *= fnqm1;
                    // integrals of the product from -1 to 0 and 0 to 1
                    let mut pint = pc[1];
                    let mut xpin = pc[1] / 2.;
                    let mut tsign = 1.;
                    for i in 2..=nq {
                        tsign = -tsign;
                        pint += tsign * pc[i] / i as f64;
                        xpin += tsign * pc[i] / (i + 1) as f64;
                    }
                    self.elco[nq][1] = pint * rq1fac;
                    self.elco[nq][2] = 1.;
                    for i in 2..=nq {
                        self.elco[nq][i + 1] = rq1fac * pc[i] / i as f64;
                    }
                    let agamq = rqfac * xpin;
                    let ragq = 1. / agamq;
                    self.tesco[nq][2] = ragq;
                    if nq < MAX_ORD_ADAMS {
                        self.tesco[nq + 1][1] = ragq * rqfac / (nq + 1) as f64;
                    }
                    self.tesco[nqm1][3] = ragq;
                }
            }
            Method::Bdf => {
                pc[1] = 1.;
                let mut rq1fac = 1.;
                for nq in 1..=MAX_ORD_BDF {
                    // pc becomes the product (x+1)(x+2)...(x+nq)
                    let fnq = nq as f64;
                    pc[nq + 1] = 0.;
                    for i in (2..=nq + 1).rev() {
                        pc[i] = pc[i - 1] + fnq * pc[i];
                    }
                    pc[1] *= fnq;
                    for i in 1..=nq + 1 {
                        self.elco[nq][i] = pc[i] / pc[2];
                    }
                    self.elco[nq][2] = 1.;
                    self.tesco[nq][1] = rq1fac;
                    self.tesco[nq][2] = (nq + 1) as f64 / self.elco[nq][1];
                    self.tesco[nq][3] = (nq + 2) as f64 / self.elco[nq][1];
                    rq1fac /= fnq;
                }
            }
        }
    }

    /// Load el for the current order and update the quantities that
    /// depend on el[1].
    #[allow(clippy::cast_precision_loss)]
    fn reset_coefficients(&mut self) {
        for i in 1..=self.l {
            self.el[i] = self.elco[self.nq][i];
        }
        self.rc = self.rc * self.el[1] / self.el0;
        self.el0 = self.el[1];
        self.conit = 0.5 / (self.nq + 2) as f64;
    }

    /// Decide whether to switch the method family, comparing the step
    /// size each family could sustain. Adams to BDF requires a factor
    /// `ratio` advantage; BDF to Adams additionally requires the Adams
    /// error estimate to stand clear of roundoff.
    #[allow(clippy::cast_precision_loss, clippy::too_many_lines)]
    fn consider_method_switch(&mut self, dsm: f64, pnorm: f64, pdh: &mut f64, rh: &mut f64) {
        if self.method == Method::Adams {
            if self.nq > MAX_ORD_BDF {
                return;
            }
            let rh2;
            let nqm2;
            if dsm <= 100. * pnorm * ETA || self.pdest == 0. {
                // The error is dominated by roundoff; only switch if the
                // step size was recently limited by stability.
                if self.irflag == 0 {
                    return;
                }
                rh2 = 2.;
                nqm2 = self.nq.min(self.mxords);
            } else {
                let exsm = 1. / self.l as f64;
                let mut rh1 = 1. / (1.2 * dsm.powf(exsm) + 0.0000012);
                let mut rh1it = 2. * rh1;
                *pdh = self.pdlast * self.h.abs();
                if *pdh * rh1 > 0.00001 {
                    rh1it = SM1[self.nq] / *pdh;
                }
                rh1 = rh1.min(rh1it);
                if self.nq > self.mxords {
                    let lm2 = self.mxords + 1;
                    let exm2 = 1. / lm2 as f64;
                    let lm2p1 = lm2 + 1;
                    let dm2 = vmnorm(self.n, &self.yh[lm2p1], &self.ewt) / self.cm2[self.mxords];
                    rh2 = 1. / (1.2 * dm2.powf(exm2) + 0.0000012);
                    nqm2 = self.mxords;
                } else {
                    let dm2 = dsm * (self.cm1[self.nq] / self.cm2[self.nq]);
                    rh2 = 1. / (1.2 * dm2.powf(exsm) + 0.0000012);
                    nqm2 = self.nq;
                }
                if rh2 < self.ratio * rh1 {
                    return;
                }
            }
            *rh = rh2;
            self.icount = 20;
            self.method = Method::Bdf;
            self.miter = self.jtyp;
            self.pdlast = 0.;
            self.nq = nqm2;
            self.l = self.nq + 1;
            return;
        }

        // Currently BDF; estimate the step size Adams could sustain.
        let exsm = 1. / self.l as f64;
        let mut rh1;
        let nqm1;
        let exm1;
        let mut dm1;
        if self.mxordn < self.nq {
            nqm1 = self.mxordn;
            let lm1 = self.mxordn + 1;
            exm1 = 1. / lm1 as f64;
            let lm1p1 = lm1 + 1;
            dm1 = vmnorm(self.n, &self.yh[lm1p1], &self.ewt) / self.cm1[self.mxordn];
            rh1 = 1. / (1.2 * dm1.powf(exm1) + 0.0000012);
        } else {
            dm1 = dsm * (self.cm2[self.nq] / self.cm1[self.nq]);
            rh1 = 1. / (1.2 * dm1.powf(exsm) + 0.0000012);
            nqm1 = self.nq;
            exm1 = exsm;
        }
        let mut rh1it = 2. * rh1;
        *pdh = self.pdnorm * self.h.abs();
        if *pdh * rh1 > 0.00001 {
            rh1it = SM1[nqm1] / *pdh;
        }
        rh1 = rh1.min(rh1it);
        let rh2 = 1. / (1.2 * dsm.powf(exsm) + 0.0000012);
        if rh1 * self.ratio < 5. * rh2 {
            return;
        }
        let alpha = rh1.max(0.001);
        dm1 *= alpha.powf(exm1);
        if dm1 <= 1000. * ETA * pnorm {
            return;
        }
        *rh = rh1;
        self.icount = 20;
        self.method = Method::Adams;
        self.miter = 0;
        self.pdlast = 0.;
        self.nq = nqm1;
        self.l = self.nq + 1;
    }

    /// Compare the step sizes attainable one order down, at the current
    /// order, and (after a success) one order up, and change nq when the
    /// gain exceeds 10 percent. Returns the order flag and the chosen rh:
    /// 0 keeps both h and nq, 1 changes only h, 2 changed nq (and the
    /// caller must reload the coefficients before rescaling).
    #[allow(clippy::cast_precision_loss)]
    fn select_order(&mut self, rhup: &mut f64, dsm: f64, pdh: &mut f64) -> (i32, f64) {
        let exsm = 1. / self.l as f64;
        let mut rhsm = 1. / (1.2 * dsm.powf(exsm) + 0.0000012);

        let mut rhdn = 0.;
        if self.nq != 1 {
            let ddn = vmnorm(self.n, &self.yh[self.l], &self.ewt) / self.tesco[self.nq][1];
            let exdn = 1. / self.nq as f64;
            rhdn = 1. / (1.3 * ddn.powf(exdn) + 0.0000013);
        }
        // For Adams the stability region limits every candidate.
        if self.method == Method::Adams {
            *pdh = (self.h.abs() * self.pdlast).max(0.000001);
            if self.l < self.lmax {
                *rhup = rhup.min(SM1[self.l] / *pdh);
            }
            rhsm = rhsm.min(SM1[self.nq] / *pdh);
            if self.nq > 1 {
                rhdn = rhdn.min(SM1[self.nq - 1] / *pdh);
            }
            self.pdest = 0.;
        }

        let newq;
        let mut rh;
        if rhsm >= *rhup {
            if rhsm >= rhdn {
                newq = self.nq;
                rh = rhsm;
            } else {
                newq = self.nq - 1;
                rh = rhdn;
                if self.kflag < 0 && rh > 1. {
                    rh = 1.;
                }
            }
        } else if *rhup <= rhdn {
            newq = self.nq - 1;
            rh = rhdn;
            if self.kflag < 0 && rh > 1. {
                rh = 1.;
            }
        } else {
            rh = *rhup;
            if rh >= 1.1 {
                let r = self.el[self.l] / self.l as f64;
                self.nq = self.l;
                self.l = self.nq + 1;
                for i in 1..=self.n {
                    self.yh[self.l][i] = self.acor[i] * r;
                }
                return (2, rh);
            }
            self.ialth = 3;
            return (0, rh);
        }

        // A change below 10 percent is not worth the rescale, unless the
        // Adams step is being held back by stability.
        let deadband_applies = if self.method == Method::Adams {
            rh * *pdh * 1.00001 < SM1[newq]
        } else {
            true
        };
        if deadband_applies && self.kflag == 0 && rh < 1.1 {
            self.ialth = 3;
            return (0, rh);
        }
        if self.kflag <= -2 {
            rh = rh.min(0.2);
        }
        if newq == self.nq {
            return (1, rh);
        }
        self.nq = newq;
        self.l = self.nq + 1;
        (2, rh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

    struct Decay {
        rate: f64,
    }

    impl System for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn derive(&mut self, _t: f64, y: &[f64], dy: &mut [f64]) -> CallbackResult {
            dy[0] = -self.rate * y[0];
            Ok(())
        }
    }

    struct Robertson;

    impl System for Robertson {
        fn dimension(&self) -> usize {
            3
        }

        fn derive(&mut self, _t: f64, y: &[f64], dy: &mut [f64]) -> CallbackResult {
            dy[0] = -0.04 * y[0] + 1e4 * y[1] * y[2];
            dy[2] = 3e7 * y[1] * y[1];
            dy[1] = -dy[0] - dy[2];
            Ok(())
        }
    }

    struct LinearDecay {
        rates: Vec<f64>,
        with_jacobian: bool,
    }

    impl System for LinearDecay {
        fn dimension(&self) -> usize {
            self.rates.len()
        }

        fn derive(&mut self, _t: f64, y: &[f64], dy: &mut [f64]) -> CallbackResult {
            for (d, &y_i, &k) in izip!(dy.iter_mut(), y, &self.rates) {
                *d = -k * y_i;
            }
            Ok(())
        }

        fn jacobian(&mut self, _t: f64, _y: &[f64], pd: &mut [Vec<f64>]) -> CallbackResult {
            let n = self.rates.len();
            for i in 1..=n {
                for j in 1..=n {
                    pd[i][j] = 0.;
                }
                pd[i][i] = -self.rates[i - 1];
            }
            Ok(())
        }

        fn provides_jacobian(&self) -> bool {
            self.with_jacobian
        }
    }

    struct Recorder {
        inner: Decay,
        samples: Vec<(f64, f64)>,
    }

    impl System for Recorder {
        fn dimension(&self) -> usize {
            1
        }

        fn derive(&mut self, t: f64, y: &[f64], dy: &mut [f64]) -> CallbackResult {
            self.inner.derive(t, y, dy)
        }

        fn solout(&mut self, t: f64, y: &[f64]) -> CallbackResult {
            self.samples.push((t, y[0]));
            Ok(())
        }
    }

    struct Failing;

    impl System for Failing {
        fn dimension(&self) -> usize {
            1
        }

        fn derive(&mut self, _t: f64, _y: &[f64], _dy: &mut [f64]) -> CallbackResult {
            Err("derivative blew up".into())
        }
    }

    const RT: [f64; 2] = [0., 1e-12];
    const AT: [f64; 2] = [0., 1e-12];

    #[test]
    fn decay_to_tout_and_continue() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let istate = solver
            .lsoda(&mut sys, 1, &[1.], 0., 0.5, 1, &RT, &AT, 1, 1, 0., None)
            .unwrap();
        assert_eq!(2, istate);
        assert_eq!(0.5, solver.t());
        assert_abs_diff_eq!((-7.5_f64).exp(), solver.y()[0], epsilon = 1e-8);

        // continue from the internal state
        let istate = solver
            .lsoda(&mut sys, 1, &[1.], 0.5, 1., 1, &RT, &AT, 1, 2, 0., None)
            .unwrap();
        assert_eq!(2, istate);
        assert_eq!(1., solver.t());
        assert_abs_diff_eq!((-15.0_f64).exp(), solver.y()[0], epsilon = 1e-8);
    }

    #[test]
    fn single_step_mode() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 2, 1, 0., None)
            .unwrap();
        assert!(solver.t() > 0.);
        assert_eq!(solver.t(), solver.tn());
        while solver.t() < 0.1 {
            let _ = solver
                .lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 2, 2, 0., None)
                .unwrap();
        }
        assert_abs_diff_eq!((-15. * solver.t()).exp(), solver.y()[0], epsilon = 1e-8);
    }

    #[test]
    fn stop_at_first_mesh_point_past_tout() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 0.2, 1, &RT, &AT, 3, 1, 0., None)
            .unwrap();
        assert!(solver.t() >= 0.2);
        assert_eq!(solver.t(), solver.tn());
        assert_abs_diff_eq!((-15. * solver.t()).exp(), solver.y()[0], epsilon = 1e-8);
    }

    #[test]
    fn tcrit_is_never_overshot() {
        let tcrit = 0.4;
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 0.39, 1, &RT, &AT, 4, 1, tcrit, None)
            .unwrap();
        assert_eq!(0.39, solver.t());
        assert!(solver.tn() <= tcrit * (1. + 1e-8));

        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0.39, tcrit, 1, &RT, &AT, 4, 2, tcrit, None)
            .unwrap();
        assert_abs_diff_eq!(tcrit, solver.t(), epsilon = 1e-12);
        assert!(solver.tn() <= tcrit * (1. + 1e-8));
        assert_abs_diff_eq!((-15. * tcrit).exp(), solver.y()[0], epsilon = 1e-8);
    }

    #[test]
    fn single_step_mode_with_tcrit() {
        let tcrit = 0.4;
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let mut istate = 1;
        while solver.t() < tcrit {
            let _ = solver
                .lsoda(&mut sys, 1, &[1.], 0., tcrit, 1, &RT, &AT, 5, istate, tcrit, None)
                .unwrap();
            istate = 2;
            assert!(solver.tn() <= tcrit * (1. + 1e-8));
        }
        assert_abs_diff_eq!(tcrit, solver.t(), epsilon = 1e-12);
        assert_abs_diff_eq!((-15. * tcrit).exp(), solver.y()[0], epsilon = 1e-8);
    }

    #[test]
    fn restart_with_tout_equal_to_t() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        for _ in 0..4 {
            let istate = solver
                .lsoda(&mut sys, 1, &[1.], 0., 0., 1, &RT, &AT, 1, 1, 0., None)
                .unwrap();
            assert_eq!(1, istate);
        }
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 0., 1, &RT, &AT, 1, 1, 0., None);
        assert!(matches!(res, Err(Error::IllegalInput { .. })));
    }

    #[test]
    fn illegal_input_leaves_state_untouched() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();

        // bad istate
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 1, 7, 0., None);
        assert!(matches!(res, Err(Error::IllegalInput { .. })));
        assert_eq!(solver.t(), solver.tn());
        assert_eq!(-3, solver.istate());

        // bad itask
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 0, 1, 0., None);
        assert!(matches!(res, Err(Error::IllegalInput { .. })));
        assert_eq!(solver.t(), solver.tn());

        // continuation before initialization
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 1, 2, 0., None);
        assert!(matches!(res, Err(Error::IllegalInput { .. })));

        // neq = 0
        let res = solver.lsoda(&mut sys, 0, &[1.], 0., 1., 1, &RT, &AT, 1, 1, 0., None);
        assert!(matches!(res, Err(Error::IllegalInput { .. })));

        // bad itol
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 0, &RT, &AT, 1, 1, 0., None);
        assert!(matches!(res, Err(Error::IllegalInput { .. })));

        // negative tolerance
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &[0., -1e-8], 1, 1, 0., None);
        assert!(matches!(res, Err(Error::IllegalInput { .. })));

        // tcrit behind tout
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 4, 1, 0.5, None);
        assert!(matches!(res, Err(Error::IllegalInput { .. })));

        // negative optional input
        let opts = Options { mxstep: -1, ..Options::default() };
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 1, 1, 0., Some(&opts));
        assert!(matches!(res, Err(Error::IllegalInput { .. })));
        assert_eq!(solver.t(), solver.tn());

        // a correct call still goes through afterwards
        let istate = solver
            .lsoda(&mut sys, 1, &[1.], 0., 0.1, 1, &RT, &AT, 1, 1, 0., None)
            .unwrap();
        assert_eq!(2, istate);
    }

    #[test]
    fn excess_work_is_reported() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let opts = Options { mxstep: 10, ..Options::default() };
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 1, 1, 0., Some(&opts));
        match res {
            Err(e @ Error::ExcessWork { .. }) => assert_eq!(-1, e.istate()),
            other => panic!("expected ExcessWork, got {other:?}"),
        }
        // best-effort solution up to tn is available
        assert_eq!(solver.t(), solver.tn());
        assert!(solver.t() > 0.);
    }

    #[test]
    fn excess_accuracy_at_start() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let res = solver.lsoda(
            &mut sys, 1, &[1.], 0., 1., 1, &[0., 1e-14], &[0., 1e-15], 1, 1, 0., None,
        );
        assert!(matches!(res, Err(Error::IllegalInput { .. })));
        assert_eq!(solver.t(), solver.tn());
    }

    #[test]
    fn interpolation_outside_last_step_fails() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 0.5, 1, &RT, &AT, 1, 1, 0., None)
            .unwrap();
        let res = solver.lsoda(&mut sys, 1, &[1.], 0.5, -0.5, 1, &RT, &AT, 1, 2, 0., None);
        assert!(matches!(res, Err(Error::Interpolation { .. })));
        assert_eq!(-3, solver.istate());
    }

    #[test]
    fn external_failure_is_propagated() {
        let mut sys = Failing;
        let mut solver = Lsoda::default();
        let res = solver.lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 1, 1, 0., None);
        assert!(matches!(res, Err(Error::External(_))));
    }

    #[test]
    fn initial_step_size_is_honored() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let opts = Options { h0: 1e-7, ..Options::default() };
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 2, 1, 0., Some(&opts))
            .unwrap();
        assert_eq!(1e-7, solver.tn());
        assert_eq!(1e-7, solver.hu());
    }

    #[test]
    fn hmax_bounds_the_first_step() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let opts = Options { hmax: 1e-20, ..Options::default() };
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 1., 1, &RT, &AT, 2, 1, 0., Some(&opts))
            .unwrap();
        assert!(solver.tn() > 0.);
        assert!(solver.tn() <= 1e-20 * (1. + 1e-10));
    }

    #[test]
    fn tolerances_can_change_mid_run() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 0.5, 1, &[0., 1e-6], &[0., 1e-6], 1, 1, 0., None)
            .unwrap();
        let istate = solver
            .lsoda(&mut sys, 1, &[1.], 0.5, 1., 1, &[0., 1e-10], &[0., 1e-12], 1, 3, 0., None)
            .unwrap();
        assert_eq!(2, istate);
        assert_eq!(1., solver.t());
        assert_abs_diff_eq!((-15.0_f64).exp(), solver.y()[0], epsilon = 1e-6);
    }

    #[test]
    fn order_limits_can_change_mid_run() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::default();
        let rt = [0., 1e-10];
        let at = [0., 1e-12];
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 0.5, 1, &rt, &at, 1, 1, 0., None)
            .unwrap();
        let nst_before = solver.stats().steps_taken;

        // Negative limits on a continuation are illegal input.
        let bad = Options { mxordn: -5, mxords: -5, ..Options::default() };
        let err = solver
            .lsoda(&mut sys, 1, &[1.], 0.5, 1., 1, &rt, &at, 1, 3, 0., Some(&bad))
            .unwrap_err();
        assert!(matches!(err, Error::IllegalInput { .. }));
        assert_eq!(solver.t(), solver.tn());

        // Capping the order mid-run forces much smaller steps but still
        // reproduces the exponential.
        let tight = Options { mxordn: 2, mxords: 2, mxstep: 20000, ..Options::default() };
        let istate = solver
            .lsoda(&mut sys, 1, &[1.], 0.5, 1., 1, &rt, &at, 1, 3, 0., Some(&tight))
            .unwrap();
        assert_eq!(2, istate);
        assert_abs_diff_eq!((-15.0_f64).exp(), solver.y()[0], epsilon = 1e-8);
        let spent = solver.stats().steps_taken - nst_before;
        assert!(spent > 2 * nst_before);
    }

    #[test]
    fn robertson_switches_to_stiff_method() {
        let mut sys = Robertson;
        let mut solver = Lsoda::default();
        let rtol = [0., 1e-4];
        let atol = [0., 1e-6, 1e-10, 1e-6];
        let opts = Options { mxstep: 20000, ..Options::default() };
        let istate = solver
            .lsoda(&mut sys, 3, &[1., 0., 0.], 0., 4e5, 2, &rtol, &atol, 1, 1, 0., Some(&opts))
            .unwrap();
        assert_eq!(2, istate);
        let y = solver.y();
        assert_abs_diff_eq!(1., y[0] + y[1] + y[2], epsilon = 1e-4);
        // At t = 4e5 nearly everything has converted to the third species.
        assert!(y[0] > 4e-3 && y[0] < 6e-3);
        assert!(y[1] > 0. && y[1] < 1e-6);
        assert!(y[2] > 0.99 && y[2] < 1.);
        assert_eq!(Method::Bdf, solver.method());
        assert!(solver.tsw() > 0.);
        assert!(solver.stats().jacobian_evaluations > 0);
    }

    #[test]
    fn stiff_linear_system_against_exact_solution() {
        let rates = vec![1., 10., 100., 1000.];
        for with_jacobian in [false, true] {
            let mut sys = LinearDecay { rates: rates.clone(), with_jacobian };
            let mut solver = Lsoda::default();
            let rtol = [0., 1e-8];
            let atol = [0., 1e-10];
            let opts = Options { mxstep: 20000, ..Options::default() };
            let y0 = [1., 1., 1., 1.];
            let _ = solver
                .lsoda(&mut sys, 4, &y0, 0., 2., 1, &rtol, &atol, 1, 1, 0., Some(&opts))
                .unwrap();
            for (i, &k) in rates.iter().enumerate() {
                assert_abs_diff_eq!((-2. * k).exp(), solver.y()[i], epsilon = 1e-6);
            }
            assert!(solver.stats().jacobian_evaluations > 0);
        }
    }

    #[test]
    fn solout_samples_every_accepted_step() {
        let mut sys = Recorder { inner: Decay { rate: 15. }, samples: Vec::new() };
        let mut solver = Lsoda::default();
        let _ = solver
            .lsoda(&mut sys, 1, &[1.], 0., 0.5, 1, &RT, &AT, 1, 1, 0., None)
            .unwrap();
        assert_eq!(solver.stats().steps_taken + 1, sys.samples.len());
        assert_eq!(0., sys.samples[0].0);
        assert!(sys.samples.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_abs_diff_eq!(solver.tn(), sys.samples[sys.samples.len() - 1].0, epsilon = 0.);
    }

    #[test]
    fn convenience_wrapper_restarts_each_call() {
        let mut sys = Decay { rate: 15. };
        let mut solver = Lsoda::new(0, 0, 1e-10, 1e-10, 12, 5);
        let y = solver.integrate(&mut sys, 0., &[1.], 0.5).unwrap();
        assert_abs_diff_eq!((-7.5_f64).exp(), y[0], epsilon = 1e-8);
        let y = solver.integrate(&mut sys, 0., &[1.], 0.25).unwrap();
        assert_abs_diff_eq!((-3.75_f64).exp(), y[0], epsilon = 1e-8);
    }

    #[test]
    fn corrector_coefficients_match_the_classic_tables() {
        let mut solver = Lsoda::default();
        solver.compute_coefficients(Method::Bdf);
        assert_abs_diff_eq!(2. / 3., solver.elco[2][1], epsilon = 1e-15);
        assert_abs_diff_eq!(1., solver.elco[2][2], epsilon = 0.);
        assert_abs_diff_eq!(1. / 3., solver.elco[2][3], epsilon = 1e-15);
        assert_abs_diff_eq!(4.5, solver.tesco[2][2], epsilon = 1e-12);

        solver.compute_coefficients(Method::Adams);
        assert_eq!(1., solver.elco[1][1]);
        assert_eq!(1., solver.elco[1][2]);
        assert_eq!(2., solver.tesco[1][2]);
        // order 2 is the trapezoidal corrector
        assert_abs_diff_eq!(0.5, solver.elco[2][1], epsilon = 1e-15);
        assert_abs_diff_eq!(0.5, solver.elco[2][3], epsilon = 1e-15);
        assert_abs_diff_eq!(12., solver.tesco[2][2], epsilon = 1e-12);
    }
}
