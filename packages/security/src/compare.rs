// ABOUTME: Constant-time comparison for secret values
// ABOUTME: Used when checking OAuth state tokens so timing does not reveal matching prefixes

use subtle::ConstantTimeEq;

/// Compare two byte strings without short-circuiting on the first difference
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).unwrap_u8() == 1
}
