/// Implements `Arbitrary` for a struct by listing its fields.
///
/// Field types are inferred, so the macro works for structs mixing std types
/// (which have upstream `Arbitrary`) with bitcoin types (which get a local
/// impl in [`qc_help`]).
macro_rules! impl_arbitrary {
    ($type:ident, $($field:ident),* $(,)?) => {
        #[cfg(test)]
        impl quickcheck::Arbitrary for $type {
            fn arbitrary(gen: &mut quickcheck::Gen) -> Self {
                let _ = &gen;
                $type {
                    $(
                        $field: crate::test_macros::qc_help::Hack::new(0).arbitrary(gen),
                    )*
                }
            }
        }
    };
}
pub(crate) use impl_arbitrary;
