// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Debug formatting for interrupt-status words.

use core::fmt;

macro_rules! debug_flags {
    ( $tyname:ident {$( $flag:ident = $offset:expr; )*} ) => {
        pub struct $tyname(pub u32);

        impl fmt::Debug for $tyname {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let w: u32 = self.0;
                write!(f, "{{")?;
                $(
                    if w & (1 << $offset) != 0 {
                        write!(f, "{} ", stringify!($flag))?;
                    }
                )*
                write!(f, "}}")
            }
        }
    };
}

debug_flags!(BusEventFlags {
    RESET = 0;
    SUSPEND = 1;
    RESUME = 2;
    SOF = 3;
    VBUS = 4;
});

debug_flags!(EndpointEventFlags {
    SETUP = 0;
    OUT = 1;
    IN = 2;
    STALLED = 3;
});

pub struct HexBuf<'a>(pub &'a [u8]);

impl<'a> fmt::Debug for HexBuf<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, b) in self.0.iter().enumerate() {
            write!(f, "{}{:02x}", if i > 0 { " " } else { "" }, b)?;
        }
        write!(f, "]")
    }
}
