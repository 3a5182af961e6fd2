use nalgebra::{DMatrix, DVector};

/// The one Kalman predict/update implementation shared by the linear KF
/// and the ES-EKF, per spec.md 9's note that re-implementations of the
/// same math across files should collapse into one. Joseph-form
/// covariance update is mandatory (spec.md invariant 2): it is the only
/// update path offered here.
///
/// `predict` applies a linear transition `x <- F x`, `P <- F P Fᵀ + Q`. Only
/// correct for filters whose nominal state genuinely transitions linearly
/// as `F x` (the 6-state linear KF); a filter whose nominal propagation is
/// nonlinear (the ES-EKF's heading-coupled kinematics) must propagate its
/// own state by hand and use `predict_covariance` below instead, with `F`
/// supplying only the linearised Jacobian for the covariance step.
pub fn predict(state: &DVector<f64>, covariance: &DMatrix<f64>, f: &DMatrix<f64>, q: &DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
    let new_state = f * state;
    let new_covariance = f * covariance * f.transpose() + q;
    (new_state, new_covariance)
}

/// Covariance-only predict: `P <- F P Fᵀ + Q`, leaving the nominal state
/// untouched. For filters that propagate their nominal state by hand
/// (a nonlinear transition) and only need `F` as the linearisation for
/// covariance propagation.
pub fn predict_covariance(covariance: &DMatrix<f64>, f: &DMatrix<f64>, q: &DMatrix<f64>) -> DMatrix<f64> {
    f * covariance * f.transpose() + q
}

/// Outcome of an `update` call: either the measurement was applied, or it
/// was rejected (innovation covariance singular even after regularisation,
/// or an external caller-side gate such as the Mahalanobis test failed
/// before this was even called).
pub enum UpdateOutcome {
    Applied {
        state: DVector<f64>,
        covariance: DMatrix<f64>,
        innovation: DVector<f64>,
        innovation_covariance: DMatrix<f64>,
    },
    Rejected,
}

/// One Joseph-form measurement update: `residual = z - H x`, `S = H P Hᵀ +
/// R`, `K = P Hᵀ S⁻¹`, `x <- x + K residual`, `P <- (I-KH) P (I-KH)ᵀ + K R
/// Kᵀ`. If `S` is singular, `eps * I` is added once before inversion; if
/// still singular, the update is rejected (spec.md 4.F).
pub fn update(
    state: &DVector<f64>,
    covariance: &DMatrix<f64>,
    h: &DMatrix<f64>,
    residual: &DVector<f64>,
    r: &DMatrix<f64>,
) -> UpdateOutcome {
    const EPS: f64 = 1e-9;

    let h_t = h.transpose();
    let s = h * covariance * &h_t + r;

    let s_inv = match s.clone().try_inverse() {
        Some(inv) => inv,
        None => {
            let regularized = &s + DMatrix::identity(s.nrows(), s.ncols()) * EPS;
            match regularized.try_inverse() {
                Some(inv) => inv,
                None => return UpdateOutcome::Rejected,
            }
        }
    };

    let k = covariance * &h_t * &s_inv;
    let new_state = state + &k * residual;

    let n = state.len();
    let identity = DMatrix::<f64>::identity(n, n);
    let i_kh = &identity - &k * h;
    let new_covariance = &i_kh * covariance * i_kh.transpose() + &k * r * k.transpose();

    UpdateOutcome::Applied {
        state: new_state,
        covariance: symmetrize(&new_covariance),
        innovation: residual.clone(),
        innovation_covariance: s,
    }
}

/// Mahalanobis distance of an innovation against its innovation
/// covariance, used for the innovation-rejection gate (spec.md 4.E/4.F).
/// Returns `None` if `s` is singular (caller should reject in that case).
pub fn mahalanobis_distance(residual: &DVector<f64>, s: &DMatrix<f64>) -> Option<f64> {
    let s_inv = s.clone().try_inverse()?;
    let d2 = (residual.transpose() * s_inv * residual)[(0, 0)];
    Some(d2.max(0.0).sqrt())
}

/// Force exact symmetry on a covariance matrix that should already be
/// symmetric up to floating-point error.
pub fn symmetrize(p: &DMatrix<f64>) -> DMatrix<f64> {
    (p + p.transpose()) * 0.5
}

/// Rescale `p` in place so its trace does not exceed `max_trace`, per
/// spec.md 4.F's numerical safeguard.
pub fn clamp_trace(p: &mut DMatrix<f64>, max_trace: f64) -> bool {
    let trace = p.trace();
    if trace > max_trace && trace > 0.0 {
        *p *= max_trace / trace;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn update_preserves_symmetry_and_reduces_uncertainty() {
        let state = DVector::from_vec(vec![0.0, 0.0]);
        let covariance = DMatrix::<f64>::from_diagonal(&DVector::from_vec(vec![10.0, 10.0]));
        let h = DMatrix::<f64>::identity(2, 2);
        let r = DMatrix::<f64>::from_diagonal(&DVector::from_vec(vec![1.0, 1.0]));
        let residual = DVector::from_vec(vec![1.0, -1.0]);

        match update(&state, &covariance, &h, &residual, &r) {
            UpdateOutcome::Applied {
                state: new_state,
                covariance: new_p,
                ..
            } => {
                let asym = (&new_p - new_p.transpose()).abs().max();
                assert!(asym < 1e-9);
                assert!(new_p.trace() < covariance.trace());
                assert!(new_state[0] > 0.0);
                assert!(new_state[1] < 0.0);
            }
            UpdateOutcome::Rejected => panic!("expected update to apply"),
        }
    }

    #[test]
    fn singular_innovation_covariance_is_regularized_not_panicking() {
        let state = DVector::from_vec(vec![0.0]);
        let covariance = DMatrix::<f64>::zeros(1, 1);
        let h = DMatrix::<f64>::identity(1, 1);
        let r = DMatrix::<f64>::zeros(1, 1);
        let residual = DVector::from_vec(vec![1.0]);

        // S = H P H^T + R = 0, singular until regularized.
        match update(&state, &covariance, &h, &residual, &r) {
            UpdateOutcome::Applied { .. } => {}
            UpdateOutcome::Rejected => panic!("regularized update should still apply"),
        }
    }

    #[test]
    fn mahalanobis_distance_matches_known_value() {
        let residual = DVector::from_vec(vec![3.0, 0.0]);
        let s = DMatrix::<f64>::from_diagonal(&DVector::from_vec(vec![9.0, 1.0]));
        let d = mahalanobis_distance(&residual, &s).unwrap();
        assert_abs_diff_eq!(d, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn clamp_trace_rescales_when_over_budget() {
        let mut p = DMatrix::<f64>::from_diagonal(&DVector::from_vec(vec![100.0, 100.0]));
        let clamped = clamp_trace(&mut p, 10.0);
        assert!(clamped);
        assert_abs_diff_eq!(p.trace(), 10.0, epsilon = 1e-9);
    }
}
