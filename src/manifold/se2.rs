//! SE(2) — rigid body transformations in the plane.
//!
//! Elements are stored as a unit complex rotation plus a 2-D translation.
//! Tangent vectors are `[x, y, theta]` with the translational part first,
//! following the manif conventions. Small-angle branches use the usual
//! Taylor expansions of `sin(theta)/theta` and `(1 - cos(theta))/theta`.

use crate::manifold::RelativePose;
use nalgebra::{DMatrix, DVector, Matrix2, Point2, UnitComplex, Vector2};
use std::fmt;
use std::fmt::{Display, Formatter};

/// SE(2) group element.
#[derive(Clone, PartialEq, Debug)]
pub struct SE2 {
    translation: Vector2<f64>,
    rotation: UnitComplex<f64>,
}

impl Display for SE2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SE2(x: {:.4}, y: {:.4}, theta: {:.4})",
            self.translation.x,
            self.translation.y,
            self.angle()
        )
    }
}

impl SE2 {
    /// Create from a translation vector and a unit complex rotation.
    pub fn new(translation: Vector2<f64>, rotation: UnitComplex<f64>) -> Self {
        SE2 {
            translation,
            rotation,
        }
    }

    /// Create from translation components and a rotation angle.
    pub fn from_xy_angle(x: f64, y: f64, theta: f64) -> Self {
        SE2::new(Vector2::new(x, y), UnitComplex::from_angle(theta))
    }

    /// The x component of the translation.
    pub fn x(&self) -> f64 {
        self.translation.x
    }

    /// The y component of the translation.
    pub fn y(&self) -> f64 {
        self.translation.y
    }

    /// The rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// The translation part.
    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    /// The rotation part as a 2x2 matrix.
    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    fn sincu_versinu(theta: f64) -> (f64, f64) {
        // a = sin(theta)/theta, b = (1 - cos(theta))/theta
        let theta_sq = theta * theta;
        if theta_sq < f64::EPSILON {
            (1.0 - theta_sq / 6.0, 0.5 * theta - theta * theta_sq / 24.0)
        } else {
            (theta.sin() / theta, (1.0 - theta.cos()) / theta)
        }
    }
}

impl RelativePose for SE2 {
    const DOF: usize = 3;
    const DIM: usize = 2;

    fn identity() -> Self {
        SE2 {
            translation: Vector2::zeros(),
            rotation: UnitComplex::identity(),
        }
    }

    fn compose(&self, other: &Self) -> Self {
        SE2 {
            translation: self.rotation * other.translation + self.translation,
            rotation: self.rotation * other.rotation,
        }
    }

    fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        SE2 {
            translation: -(rot_inv * self.translation),
            rotation: rot_inv,
        }
    }

    fn exp(tangent: &DVector<f64>) -> Self {
        debug_assert_eq!(tangent.len(), Self::DOF);
        let (x, y, theta) = (tangent[0], tangent[1], tangent[2]);
        let (a, b) = Self::sincu_versinu(theta);
        SE2 {
            translation: Vector2::new(a * x - b * y, b * x + a * y),
            rotation: UnitComplex::from_angle(theta),
        }
    }

    fn log(&self) -> DVector<f64> {
        let theta = self.angle();
        let (a, b) = Self::sincu_versinu(theta);
        let den = 1.0 / (a * a + b * b);
        let x = (a * self.x() + b * self.y()) * den;
        let y = (-b * self.x() + a * self.y()) * den;
        DVector::from_vec(vec![x, y, theta])
    }

    fn rotation(&self) -> DMatrix<f64> {
        let r = self.rotation_matrix();
        DMatrix::from_fn(2, 2, |i, j| r[(i, j)])
    }

    fn transform_point(&self, point: &DVector<f64>) -> DVector<f64> {
        debug_assert_eq!(point.len(), Self::DIM);
        let p = self
            .rotation
            .transform_point(&Point2::new(point[0], point[1]))
            .coords
            + self.translation;
        DVector::from_vec(vec![p.x, p.y])
    }

    fn point_action_jacobian(point: &DVector<f64>) -> DMatrix<f64> {
        debug_assert_eq!(point.len(), Self::DIM);
        // d(exp(delta) . p)/d(delta) at delta = 0: [I2 | J p], J = [[0,-1],[1,0]]
        let mut jac = DMatrix::zeros(2, 3);
        jac[(0, 0)] = 1.0;
        jac[(1, 1)] = 1.0;
        jac[(0, 2)] = -point[1];
        jac[(1, 2)] = point[0];
        jac
    }

    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        SE2::from_xy_angle(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-std::f64::consts::PI..std::f64::consts::PI),
        )
    }
}
