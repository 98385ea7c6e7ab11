/// Builds a [`crate::DynamicValue::Object`] from `"field" => value` pairs.
/// Values go through `DynamicValue::from`.
#[macro_export]
macro_rules! dyn_obj {
    () => {
        $crate::DynamicValue::Object(::std::collections::BTreeMap::new())
    };
    ($($field:expr => $value:expr),+ $(,)?) => {{
        let mut fields = ::std::collections::BTreeMap::new();
        $(
            fields.insert(
                ::std::string::String::from($field),
                $crate::DynamicValue::from($value),
            );
        )+
        $crate::DynamicValue::Object(fields)
    }};
}

/// Builds a [`crate::DynamicValue::Array`] from values.
#[macro_export]
macro_rules! dyn_array {
    ($($value:expr),* $(,)?) => {
        $crate::DynamicValue::Array(::std::vec![$($crate::DynamicValue::from($value)),*])
    };
}
