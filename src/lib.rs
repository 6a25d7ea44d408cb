/*!
Particle based liquid simulation with SPH and PCISPH pressure solvers.

The solver runs either serially or as a kernel program on a `ComputeBackend`; both paths execute the
same per particle math.
*/

mod simulation;

pub use simulation::*;
