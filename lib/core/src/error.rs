//! Error handling foundation for botwright.
//!
//! Only the `Result` alias lives here. Each crate defines its own error
//! enums in an `error` module; boundaries that need to attach context wrap
//! them in a rootcause [`Report`].

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_alias_holds_values() {
        let ok: Result<&str> = Ok("deployed");
        assert_eq!(ok.expect("should be ok"), "deployed");
    }
}
