use std::iter::Enumerate;
use std::vec::IntoIter;

use protocol::Value;
use serde::de::DeserializeOwned;

use crate::InvocationError;

/// Conversion from a positional argument list into typed handler arguments.
///
/// Implemented for `Vec<Value>` (no conversion), `()` and tuples of up to six
/// deserialisable elements. Arity and type mismatches are reported as
/// `InvalidParamsError`.
pub trait FromParams: Sized {
    /// Converts `params`, checking arity and element types.
    fn from_params(params: Vec<Value>) -> Result<Self, InvocationError>;
}

impl FromParams for Vec<Value> {
    fn from_params(params: Vec<Value>) -> Result<Self, InvocationError> {
        Ok(params)
    }
}

impl FromParams for () {
    fn from_params(params: Vec<Value>) -> Result<Self, InvocationError> {
        check_arity(&params, 0)
    }
}

fn check_arity(params: &[Value], expected: usize) -> Result<(), InvocationError> {
    if params.len() == expected {
        Ok(())
    } else {
        Err(InvocationError::invalid_params(format!(
            "expected {expected} argument(s), got {}",
            params.len()
        )))
    }
}

fn next_argument<T: DeserializeOwned>(
    args: &mut Enumerate<IntoIter<Value>>,
) -> Result<T, InvocationError> {
    let (index, value) = args
        .next()
        .ok_or_else(|| InvocationError::invalid_params("missing argument"))?;
    rmpv::ext::from_value(value)
        .map_err(|e| InvocationError::invalid_params(format!("argument {index}: {e}")))
}

macro_rules! tuple_from_params {
    ($count:expr; $($ty:ident),+) => {
        impl<$($ty: DeserializeOwned),+> FromParams for ($($ty,)+) {
            fn from_params(params: Vec<Value>) -> Result<Self, InvocationError> {
                check_arity(&params, $count)?;
                let mut args = params.into_iter().enumerate();
                Ok(($(next_argument::<$ty>(&mut args)?,)+))
            }
        }
    };
}

tuple_from_params!(1; A);
tuple_from_params!(2; A, B);
tuple_from_params!(3; A, B, C);
tuple_from_params!(4; A, B, C, D);
tuple_from_params!(5; A, B, C, D, E);
tuple_from_params!(6; A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_elements_are_deserialised_in_order() {
        let (name, count, ratio): (String, u32, f64) = FromParams::from_params(vec![
            Value::from("x"),
            Value::from(4),
            Value::from(0.5),
        ])
        .unwrap();
        assert_eq!(name, "x");
        assert_eq!(count, 4);
        assert_eq!(ratio, 0.5);
    }

    #[test]
    fn wrong_arity_is_invalid_params() {
        let err = <(i64, i64)>::from_params(vec![Value::from(1)]).unwrap_err();
        assert_eq!(err.kind(), "InvalidParamsError");
        assert_eq!(err.message(), "expected 2 argument(s), got 1");

        assert!(<()>::from_params(vec![Value::Nil]).is_err());
    }

    #[test]
    fn wrong_type_names_the_argument() {
        let err = <(i64, i64)>::from_params(vec![Value::from(1), Value::from("two")]).unwrap_err();
        assert!(err.message().starts_with("argument 1:"));
    }

    #[test]
    fn optional_argument_accepts_nil() {
        let (v,): (Option<i64>,) = FromParams::from_params(vec![Value::Nil]).unwrap();
        assert_eq!(v, None);
    }
}
