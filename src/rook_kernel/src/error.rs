//! Error types returned by the kernel API.
//!
//! Only conditions that a correct caller can legitimately encounter at
//! runtime are surfaced as `Result`s. Caller contract violations (bad
//! priority range, double initialization, calls on dead objects) are checked
//! by the `debug_api` feature and routed to the assertion hook instead.

/// Defines an error enum and the `From` conversions into each of the listed
/// wider error types. Every variant must exist in every target type.
macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Super:ty )] )*
        pub enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $Name {
            $( $Variant, )*
        }

        define_error_into! {
            @supers [ $( $Super , )* ]
            @name $Name
            @variants [ $( $Variant )* ]
        }
    };
}

/// Helper for [`define_error!`] that emits the `From` impls one `$Super` at
/// a time. Split out (and made recursive) because the matcher can't nest
/// the `$Super` repetition with the `$Variant` repetition from the outer
/// macro within a single transcription.
macro_rules! define_error_into {
    (@supers [] @name $Name:ident @variants [ $( $Variant:ident )* ]) => {};
    (
        @supers [ $Super:ty , $( $Rest:ty , )* ]
        @name $Name:ident
        @variants [ $( $Variant:ident )* ]
    ) => {
        impl From<$Name> for $Super {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant, )*
                }
            }
        }

        define_error_into! {
            @supers [ $( $Rest , )* ]
            @name $Name
            @variants [ $( $Variant )* ]
        }
    };
}

define_error! {
    /// The operation is not allowed in the current context, e.g. it was
    /// attempted while the CPU lock was already active.
    #[into(WaitError)]
    pub enum BadContextError {
        BadContext,
    }
}

/// The result of a blocking operation. A blocked thread carries the value a
/// wake-upper stored for it and returns it from the blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The operation was attempted in a context that cannot block.
    BadContext,
    /// The object being waited upon was terminated while the caller was
    /// blocked on it.
    ObjectRemoved,
    /// The wait timed out.
    Timeout,
}
