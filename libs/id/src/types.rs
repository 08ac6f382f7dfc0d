//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Commit path
// =============================================================================

// One accepted API call. Survives coalescing: a merged call keeps the id of
// the incoming call.
define_id!(CallId, "call");

// One scheduling cycle (one placement attempt for one object).
define_id!(CycleId, "cyc");
