//! Opaque values carried by registered calls, signals, and labels.
//!
//! Control-plane payloads are type-erased so the dispatch surface stays
//! uniform; receivers downcast to the concrete type they expect.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;

#[derive(Clone)]
pub struct Arg {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Arg {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The unit value, used where a call has nothing to return.
    pub fn unit() -> Self {
        Arg::new(())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Downcast with a typed error naming both sides of the mismatch.
    pub fn extract<T: Any>(&self) -> Result<&T, Error> {
        self.downcast_ref::<T>().ok_or(Error::ArgCast {
            expected: std::any::type_name::<T>(),
            found: self.type_name,
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arg<{}>", self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::Arg;
    use crate::error::Error;

    #[test]
    fn extract_returns_the_stored_value() {
        let arg = Arg::new(42i32);
        assert_eq!(*arg.extract::<i32>().expect("extract i32"), 42);
    }

    #[test]
    fn extract_mismatch_names_both_types() {
        let arg = Arg::new("hello".to_string());
        let err = arg.extract::<i64>().expect_err("expected type mismatch");
        match err {
            Error::ArgCast { expected, found } => {
                assert!(expected.contains("i64"));
                assert!(found.contains("String"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clones_share_the_same_value() {
        let arg = Arg::new(vec![1u8, 2, 3]);
        let clone = arg.clone();
        assert_eq!(
            arg.extract::<Vec<u8>>().expect("original"),
            clone.extract::<Vec<u8>>().expect("clone")
        );
    }
}
