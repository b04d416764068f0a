//! SE(3) — rigid body transformations in 3-D space.
//!
//! Elements are stored as a unit quaternion rotation plus a 3-D translation.
//! Tangent vectors are `[rho(3), theta(3)]` with the translational part
//! first, following the manif conventions. The exp map applies the usual
//! left Jacobian `V(theta)` to the translational part; `log` applies its
//! inverse. Both switch to Taylor expansions near `theta -> 0`.

use crate::manifold::RelativePose;
use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3};
use std::fmt;
use std::fmt::{Display, Formatter};

/// SE(3) group element.
#[derive(Clone, PartialEq)]
pub struct SE3 {
    translation: Vector3<f64>,
    rotation: UnitQuaternion<f64>,
}

impl Display for SE3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let t = self.translation;
        let q = self.rotation.quaternion();
        write!(
            f,
            "SE3(translation: [{:.4}, {:.4}, {:.4}], rotation: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            t.x, t.y, t.z, q.w, q.i, q.j, q.k
        )
    }
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Left Jacobian of SO(3): V = I + (1-cos)/t^2 W + (t-sin)/t^3 W^2.
fn so3_left_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
    let t = theta.norm();
    let w = skew(theta);
    if t < 1e-8 {
        Matrix3::identity() + 0.5 * w + (w * w) / 6.0
    } else {
        let t2 = t * t;
        Matrix3::identity() + ((1.0 - t.cos()) / t2) * w + ((t - t.sin()) / (t2 * t)) * (w * w)
    }
}

/// Inverse of the SO(3) left Jacobian.
fn so3_left_jacobian_inv(theta: &Vector3<f64>) -> Matrix3<f64> {
    let t = theta.norm();
    let w = skew(theta);
    if t < 1e-8 {
        Matrix3::identity() - 0.5 * w + (w * w) / 12.0
    } else {
        let t2 = t * t;
        let coef = 1.0 / t2 - (1.0 + t.cos()) / (2.0 * t * t.sin());
        Matrix3::identity() - 0.5 * w + coef * (w * w)
    }
}

impl SE3 {
    /// Create from a translation vector and a unit quaternion.
    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        SE3 {
            translation,
            rotation,
        }
    }

    /// Create from translation components and Euler angles.
    pub fn from_translation_euler(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        SE3::new(
            Vector3::new(x, y, z),
            UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        )
    }

    /// The translation part.
    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    /// The rotation part.
    pub fn rotation_quaternion(&self) -> UnitQuaternion<f64> {
        self.rotation
    }

    /// The rotation part as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}

impl RelativePose for SE3 {
    const DOF: usize = 6;
    const DIM: usize = 3;

    fn identity() -> Self {
        SE3 {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
        }
    }

    fn compose(&self, other: &Self) -> Self {
        SE3 {
            translation: self.rotation * other.translation + self.translation,
            rotation: self.rotation * other.rotation,
        }
    }

    fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        SE3 {
            translation: -(rot_inv * self.translation),
            rotation: rot_inv,
        }
    }

    fn exp(tangent: &DVector<f64>) -> Self {
        debug_assert_eq!(tangent.len(), Self::DOF);
        let rho = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let theta = Vector3::new(tangent[3], tangent[4], tangent[5]);
        SE3 {
            translation: so3_left_jacobian(&theta) * rho,
            rotation: UnitQuaternion::from_scaled_axis(theta),
        }
    }

    fn log(&self) -> DVector<f64> {
        let theta = self.rotation.scaled_axis();
        let rho = so3_left_jacobian_inv(&theta) * self.translation;
        DVector::from_vec(vec![rho.x, rho.y, rho.z, theta.x, theta.y, theta.z])
    }

    fn rotation(&self) -> DMatrix<f64> {
        let r = self.rotation_matrix();
        DMatrix::from_fn(3, 3, |i, j| r[(i, j)])
    }

    fn transform_point(&self, point: &DVector<f64>) -> DVector<f64> {
        debug_assert_eq!(point.len(), Self::DIM);
        let p = self.rotation * Vector3::new(point[0], point[1], point[2]) + self.translation;
        DVector::from_vec(vec![p.x, p.y, p.z])
    }

    fn point_action_jacobian(point: &DVector<f64>) -> DMatrix<f64> {
        debug_assert_eq!(point.len(), Self::DIM);
        // d(exp(delta) . p)/d(delta) at delta = 0: [I3 | -skew(p)]
        let p = Vector3::new(point[0], point[1], point[2]);
        let s = skew(&p);
        let mut jac = DMatrix::zeros(3, 6);
        for i in 0..3 {
            jac[(i, i)] = 1.0;
            for j in 0..3 {
                jac[(i, 3 + j)] = -s[(i, j)];
            }
        }
        jac
    }

    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let axis = Vector3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        );
        SE3 {
            translation: Vector3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
            ),
            rotation: UnitQuaternion::from_scaled_axis(axis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    const TOLERANCE: f64 = 1e-9;

    #[test]
    fn test_se3_identity_compose() {
        let a = SE3::from_translation_euler(1.0, 2.0, 3.0, 0.1, 0.2, 0.3);
        let c = a.compose(&SE3::identity());
        assert!(a.is_approx(&c, TOLERANCE));
    }

    #[test]
    fn test_se3_inverse() {
        let a = SE3::from_translation_euler(1.0, -2.0, 0.5, 0.3, -0.1, 0.8);
        assert!(a.compose(&a.inverse()).log().norm() < TOLERANCE);
    }

    #[test]
    fn test_se3_exp_log_round_trip() {
        let t = DVector::from_vec(vec![0.5, -0.3, 0.1, 0.2, 0.4, -0.6]);
        let recovered = SE3::exp(&t).log();
        assert!((recovered - t).norm() < TOLERANCE);
    }

    #[test]
    fn test_se3_exp_log_small_angle() {
        let t = DVector::from_vec(vec![1e-7, -2e-7, 3e-7, 1e-9, -1e-9, 2e-9]);
        let recovered = SE3::exp(&t).log();
        assert!((recovered - t).norm() < 1e-12);
    }

    #[test]
    fn test_se3_transform_point() {
        let pose = SE3::from_translation_euler(1.0, 0.0, 0.0, 0.0, 0.0, FRAC_PI_2);
        let p = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let q = pose.transform_point(&p);

        assert!((q[0] - 1.0).abs() < TOLERANCE);
        assert!((q[1] - 1.0).abs() < TOLERANCE);
        assert!(q[2].abs() < TOLERANCE);
    }

    #[test]
    fn test_se3_pure_translation_exp() {
        let t = DVector::from_vec(vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let pose = SE3::exp(&t);
        assert!((pose.translation() - Vector3::new(1.0, 2.0, 3.0)).norm() < TOLERANCE);
    }
}
