//! Dense vector helpers.

#[inline(always)]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    let chunks = a.len() / 4;
    for i in 0..chunks {
        let base = i * 4;

        dot += a[base] * b[base] + a[base + 1] * b[base + 1]
            + a[base + 2] * b[base + 2] + a[base + 3] * b[base + 3];

        norm_a += a[base] * a[base] + a[base + 1] * a[base + 1]
            + a[base + 2] * a[base + 2] + a[base + 3] * a[base + 3];

        norm_b += b[base] * b[base] + b[base + 1] * b[base + 1]
            + b[base + 2] * b[base + 2] + b[base + 3] * b[base + 3];
    }

    for i in (chunks * 4)..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();

    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale to unit length. A zero vector is returned as-is.
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = l2_norm(vector);
    if norm > 0.0 {
        vector.iter().map(|v| v / norm).collect()
    } else {
        vector.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_norm() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_left_alone() {
        assert_eq!(normalize(&[0.0, 0.0, 0.0]), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn cosine_handles_tail_elements() {
        let a = [1.0, 0.0, 0.0, 0.0, 1.0];
        let b = [1.0, 0.0, 0.0, 0.0, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0; 5]), 0.0);
    }
}
