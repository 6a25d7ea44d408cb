use std::marker::PhantomData;

use crate::{
    error::ConfigError,
    floating_type_mod::{FT, PI},
};

/**
 * Closed form of a radially symmetric smoothing kernel with support radius `h`.
 *
 * The derivative values are the scalar factors the solver multiplies with a direction
 * (or a difference vector). They are only evaluated for `0 <= r <= h`.
 */
pub trait KernelShape: Send + Sync {
    const NAME: &'static str;

    fn weight(r: FT, h: FT) -> FT;
    fn first_derivative(r: FT, h: FT) -> FT;
    fn second_derivative(r: FT, h: FT) -> FT;
}

/// Poly6 kernel, used for density and the surface tension color field.
pub enum DensityKernel {}

impl KernelShape for DensityKernel {
    const NAME: &'static str = "density";

    fn weight(r: FT, h: FT) -> FT {
        let x = h * h - r * r;
        315. / (64. * PI * h.powi(9)) * x * x * x
    }

    fn first_derivative(r: FT, h: FT) -> FT {
        let x = h * h - r * r;
        -945. / (32. * PI * h.powi(9)) * x * x
    }

    fn second_derivative(r: FT, h: FT) -> FT {
        let h2 = h * h;
        let r2 = r * r;
        -945. / (32. * PI * h.powi(9)) * (h2 - r2) * (3. * h2 - 7. * r2)
    }
}

/// Spiky kernel. Its gradient does not vanish near the center, which keeps particles apart.
pub enum PressureKernel {}

impl KernelShape for PressureKernel {
    const NAME: &'static str = "pressure";

    fn weight(r: FT, h: FT) -> FT {
        let x = h - r;
        15. / (PI * h.powi(6)) * x * x * x
    }

    fn first_derivative(r: FT, h: FT) -> FT {
        let x = h - r;
        -45. / (PI * h.powi(6)) * x * x
    }

    fn second_derivative(r: FT, h: FT) -> FT {
        -90. / (PI * h.powi(6)) * (h - r) * (h - 2. * r) / h
    }
}

/**
 * Viscosity kernel with a positive laplacian everywhere inside the support.
 *
 * Weight and gradient are singular at `r = 0`; the cached tables store the resulting infinities
 * in their first entry. The solver only samples the laplacian of this kernel.
 */
pub enum ViscosityKernel {}

impl KernelShape for ViscosityKernel {
    const NAME: &'static str = "viscosity";

    fn weight(r: FT, h: FT) -> FT {
        let h2 = h * h;
        let h3 = h2 * h;
        15. / (2. * PI * h3) * (r * r / h2 - r * r * r / (2. * h3) + h / (2. * r) - 1.)
    }

    fn first_derivative(r: FT, h: FT) -> FT {
        let h2 = h * h;
        let h3 = h2 * h;
        15. / (2. * PI * h3) * (2. / h2 - 3. * r / (2. * h3) - h / (2. * r * r * r))
    }

    fn second_derivative(r: FT, h: FT) -> FT {
        45. / (PI * h.powi(6)) * (h - r)
    }
}

/// Read-only view on one sampled table. Shared by the host solver and the device program.
#[derive(Clone, Copy, Debug)]
pub struct LookupTable<'a> {
    values: &'a [FT],
    step: FT,
    radius: FT,
}

impl<'a> LookupTable<'a> {
    pub fn new(values: &'a [FT], step: FT, radius: FT) -> Self {
        LookupTable { values, step, radius }
    }

    /// Truncates to the table entry below `distance`; `0` outside of the support.
    #[inline(always)]
    pub fn sample(&self, distance: FT) -> FT {
        if !(distance < self.radius) || distance < 0. {
            return 0.;
        }
        let idx = (distance / self.step).floor() as usize;
        match self.values.get(idx) {
            Some(&v) => v,
            None => 0.,
        }
    }

    pub fn values(&self) -> &'a [FT] {
        self.values
    }
}

pub struct CachedKernel<S: KernelShape> {
    radius: FT,
    subdivisions: usize,
    step: FT,
    weights: Vec<FT>,
    first_derivatives: Vec<FT>,
    second_derivatives: Vec<FT>,
    shape: PhantomData<S>,
}

impl<S: KernelShape> CachedKernel<S> {
    pub fn new(radius: FT, subdivisions: usize) -> Result<Self, ConfigError> {
        let mut kernel = CachedKernel {
            radius: 0.,
            subdivisions: 0,
            step: 0.,
            weights: Vec::new(),
            first_derivatives: Vec::new(),
            second_derivatives: Vec::new(),
            shape: PhantomData,
        };
        kernel.configure(radius, subdivisions)?;
        Ok(kernel)
    }

    /// Rebuilds all three tables. On error the previous tables stay in place.
    pub fn configure(&mut self, radius: FT, subdivisions: usize) -> Result<(), ConfigError> {
        ConfigError::check_positive("kernel_radius", radius)?;
        ConfigError::check_at_least("kernel_subdivisions", subdivisions, 1)?;

        let step = radius / subdivisions as FT;
        let sample = |f: fn(FT, FT) -> FT| -> Vec<FT> {
            (0..=subdivisions)
                .map(|i| {
                    // the last entry sits exactly on the support radius
                    let r = if i == subdivisions { radius } else { i as FT * step };
                    f(r, radius)
                })
                .collect()
        };

        let weights = sample(S::weight);
        let first_derivatives = sample(S::first_derivative);
        let second_derivatives = sample(S::second_derivative);

        self.radius = radius;
        self.subdivisions = subdivisions;
        self.step = step;
        self.weights = weights;
        self.first_derivatives = first_derivatives;
        self.second_derivatives = second_derivatives;
        Ok(())
    }

    pub fn radius(&self) -> FT {
        self.radius
    }

    pub fn subdivisions(&self) -> usize {
        self.subdivisions
    }

    pub fn step(&self) -> FT {
        self.step
    }

    pub fn weight(&self, distance: FT) -> FT {
        self.weight_table().sample(distance)
    }

    pub fn gradient_magnitude(&self, distance: FT) -> FT {
        self.gradient_table().sample(distance)
    }

    pub fn laplacian(&self, distance: FT) -> FT {
        self.laplacian_table().sample(distance)
    }

    pub fn weight_table(&self) -> LookupTable {
        LookupTable::new(&self.weights, self.step, self.radius)
    }

    pub fn gradient_table(&self) -> LookupTable {
        LookupTable::new(&self.first_derivatives, self.step, self.radius)
    }

    pub fn laplacian_table(&self) -> LookupTable {
        LookupTable::new(&self.second_derivatives, self.step, self.radius)
    }
}

/// Number of tables in a `KernelLookups` and in the packed device upload.
pub const KERNEL_TABLE_COUNT: usize = 5;

/// The five tables the simulation stages sample.
#[derive(Clone, Copy, Debug)]
pub struct KernelLookups<'a> {
    pub density_weight: LookupTable<'a>,
    pub density_gradient: LookupTable<'a>,
    pub density_laplacian: LookupTable<'a>,
    pub pressure_gradient: LookupTable<'a>,
    pub viscosity_laplacian: LookupTable<'a>,
}

impl<'a> KernelLookups<'a> {
    pub fn tables(&self) -> [LookupTable<'a>; KERNEL_TABLE_COUNT] {
        [
            self.density_weight,
            self.density_gradient,
            self.density_laplacian,
            self.pressure_gradient,
            self.viscosity_laplacian,
        ]
    }

    /// Builds a view over `KERNEL_TABLE_COUNT` tables stored back to back, each `entries` long.
    pub fn from_packed(packed: &'a [FT], entries: usize, step: FT, radius: FT) -> Option<Self> {
        if entries == 0 || packed.len() < entries * KERNEL_TABLE_COUNT {
            return None;
        }
        let table = |k: usize| LookupTable::new(&packed[k * entries..(k + 1) * entries], step, radius);
        Some(KernelLookups {
            density_weight: table(0),
            density_gradient: table(1),
            density_laplacian: table(2),
            pressure_gradient: table(3),
            viscosity_laplacian: table(4),
        })
    }
}

pub struct SphKernels {
    pub density: CachedKernel<DensityKernel>,
    pub pressure: CachedKernel<PressureKernel>,
    pub viscosity: CachedKernel<ViscosityKernel>,
}

impl SphKernels {
    pub fn new(radius: FT, subdivisions: usize) -> Result<Self, ConfigError> {
        Ok(SphKernels {
            density: CachedKernel::new(radius, subdivisions)?,
            pressure: CachedKernel::new(radius, subdivisions)?,
            viscosity: CachedKernel::new(radius, subdivisions)?,
        })
    }

    pub fn configure(&mut self, radius: FT, subdivisions: usize) -> Result<(), ConfigError> {
        // build into fresh kernels so a failure cannot leave the family half updated
        *self = SphKernels::new(radius, subdivisions)?;
        Ok(())
    }

    pub fn lookups(&self) -> KernelLookups {
        KernelLookups {
            density_weight: self.density.weight_table(),
            density_gradient: self.density.gradient_table(),
            density_laplacian: self.density.laplacian_table(),
            pressure_gradient: self.pressure.gradient_table(),
            viscosity_laplacian: self.viscosity.laplacian_table(),
        }
    }

    pub fn entries_per_table(&self) -> usize {
        self.density.subdivisions() + 1
    }

    /// All five tables back to back, the layout `KernelLookups::from_packed` reads.
    pub fn packed_tables(&self) -> Vec<FT> {
        let mut packed = Vec::with_capacity(self.entries_per_table() * KERNEL_TABLE_COUNT);
        for table in self.lookups().tables() {
            packed.extend_from_slice(table.values());
        }
        packed
    }
}

#[cfg(test)]
fn check_relative(a: FT, b: FT, what: &str) {
    let tolerance = 1e-5 * FT::max(a.abs(), b.abs());
    crate::assert_ft_approx_eq(a, b, tolerance, || format!("{}", what));
}

#[test]
fn kernel_coefficients_at_unit_radius() {
    let kernels = SphKernels::new(1., 1000).unwrap();

    check_relative(kernels.density.weight(0.), 315. / (64. * PI), "density weight at center");
    check_relative(kernels.density.gradient_magnitude(0.), -945. / (32. * PI), "density gradient at center");
    check_relative(kernels.density.laplacian(0.), -945. / (32. * PI) * 3., "density laplacian at center");

    check_relative(kernels.pressure.weight(0.), 15. / PI, "pressure weight at center");
    check_relative(kernels.pressure.gradient_magnitude(0.), -45. / PI, "pressure gradient at center");
    check_relative(kernels.pressure.laplacian(0.), -90. / PI, "pressure laplacian at center");

    check_relative(kernels.viscosity.laplacian(0.), 45. / PI, "viscosity laplacian at center");

    let expected = 15. / (2. * PI) * (0.25 - 0.0625 + 1. - 1.);
    let sampled = kernels.viscosity.weight_table().values()[500];
    crate::assert_ft_approx_eq(sampled, expected, 1e-4 * expected, || {
        format!("viscosity weight at half radius")
    });
}

#[test]
fn kernels_vanish_at_and_beyond_support() {
    for radius in [0.01, 0.0457, 1., 3.5] {
        let kernels = SphKernels::new(radius, 1000).unwrap();

        let last = kernels.entries_per_table() - 1;
        for table in kernels.lookups().tables() {
            crate::assert_ft_approx_eq(table.values()[last], 0., 1e-5, || {
                format!("last table entry for radius {}", radius)
            });
        }
        crate::assert_ft_approx_eq(
            kernels.viscosity.weight_table().values()[last],
            0.,
            1e-5,
            || format!("viscosity weight at radius {}", radius),
        );

        for d in [radius, radius * 1.0001, radius * 2., 1e6] {
            assert_eq!(kernels.density.weight(d), 0.);
            assert_eq!(kernels.density.gradient_magnitude(d), 0.);
            assert_eq!(kernels.density.laplacian(d), 0.);
            assert_eq!(kernels.pressure.weight(d), 0.);
            assert_eq!(kernels.pressure.gradient_magnitude(d), 0.);
            assert_eq!(kernels.pressure.laplacian(d), 0.);
            assert_eq!(kernels.viscosity.weight(d), 0.);
            assert_eq!(kernels.viscosity.laplacian(d), 0.);
        }
    }
}

#[test]
fn lookup_truncates_to_lower_entry() {
    let kernel = CachedKernel::<PressureKernel>::new(1., 10).unwrap();
    let table = kernel.weight_table();
    assert_eq!(table.values().len(), 11);
    assert_eq!(kernel.weight(0.19), table.values()[1]);
    assert_eq!(kernel.weight(0.2), table.values()[2]);
    assert_eq!(kernel.weight(0.999), table.values()[9]);
}

#[test]
fn reconfigure_is_deterministic() {
    let mut a = SphKernels::new(0.0457, 1000).unwrap();
    let b = SphKernels::new(0.0457, 1000).unwrap();
    a.configure(0.1, 17).unwrap();
    a.configure(0.0457, 1000).unwrap();
    assert_eq!(a.packed_tables(), b.packed_tables());
}

#[test]
fn invalid_configuration_keeps_tables() {
    let mut kernel = CachedKernel::<DensityKernel>::new(0.5, 100).unwrap();
    let before: Vec<FT> = kernel.weight_table().values().to_vec();

    assert!(kernel.configure(0., 100).is_err());
    assert!(kernel.configure(-1., 100).is_err());
    assert!(kernel.configure(FT::NAN, 100).is_err());
    assert!(kernel.configure(0.5, 0).is_err());

    assert_eq!(kernel.radius(), 0.5);
    assert_eq!(kernel.weight_table().values(), &before[..]);
}

#[test]
fn packed_tables_round_trip_through_lookups() {
    let kernels = SphKernels::new(0.25, 64).unwrap();
    let packed = kernels.packed_tables();
    assert_eq!(packed.len(), kernels.entries_per_table() * KERNEL_TABLE_COUNT);
    assert_eq!(kernels.lookups().tables().len(), KERNEL_TABLE_COUNT);
    let view = KernelLookups::from_packed(&packed, kernels.entries_per_table(), kernels.density.step(), 0.25).unwrap();
    for d in [0., 0.01, 0.1, 0.2, 0.249] {
        assert_eq!(view.density_weight.sample(d), kernels.density.weight(d));
        assert_eq!(view.pressure_gradient.sample(d), kernels.pressure.gradient_magnitude(d));
        assert_eq!(view.viscosity_laplacian.sample(d), kernels.viscosity.laplacian(d));
    }
    assert!(KernelLookups::from_packed(&packed[1..], kernels.entries_per_table(), 0.1, 0.25).is_none());
}
