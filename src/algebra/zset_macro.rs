/// Allows easily creating [`ZSet`](crate::algebra::ZSet)s in tests and
/// examples.
#[macro_export]
macro_rules! zset {
    ( $($value:expr => $weight:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut zset = $crate::algebra::ZSet::new();
        $( zset.insert($value, $weight); )*
        zset
    }};
}
