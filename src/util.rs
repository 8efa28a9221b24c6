/// adds `From<D>` for an enum with a variant containing D
///
/// N.B. this is also handled by enum_delegate::implement
#[macro_export]
macro_rules! variant_from_data {
    ($enum:ty, $variant:ident, $data_type:ty) => {
        impl std::convert::From<$data_type> for $enum {
            fn from(c: $data_type) -> Self {
                <$enum>::$variant(c)
            }
        }
    };
}
