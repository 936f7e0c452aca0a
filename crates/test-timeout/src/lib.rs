//! Test attributes that fail a test after a wall-clock deadline instead of
//! letting it hang the whole run.
//!
//! `#[tokio_timeout_test(10)]` runs an async test on a fresh current-thread
//! runtime; `#[tokio_timeout_test(10, paused)]` starts that runtime with the
//! clock paused. `#[timeout(10)]` guards a synchronous test.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_SECS,
            paused: false,
        };
        if input.is_empty() {
            return Ok(args);
        }
        let lit: LitInt = input.parse()?;
        args.secs = lit.base10_parse()?;
        if args.secs == 0 {
            return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
        }
        if input.parse::<Option<Token![,]>>()?.is_some() && !input.is_empty() {
            let flag: Ident = input.parse()?;
            if flag != "paused" {
                return Err(syn::Error::new_spanned(flag, "expected `paused`"));
            }
            args.paused = true;
        }
        if !input.is_empty() {
            return Err(input.error("unexpected tokens after timeout arguments"));
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;
    let attrs = strip(attrs, &["tokio", "test"]);

    let builder = if args.paused {
        quote! { tokio::runtime::Builder::new_current_thread().enable_all().start_paused(true) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread().enable_all() }
    };
    // Virtual time auto-advances when paused, so only the wall-clock guard applies.
    let run = if args.paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(deadline, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };
    let body = quote! {
        let runtime = #builder.build().expect("failed to build test runtime");
        #run
    };
    guarded(attrs, vis, sig, args.secs, body)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "timeout expects a synchronous fn")
            .to_compile_error()
            .into();
    }
    if args.paused {
        return syn::Error::new_spanned(&sig.ident, "`paused` only applies to async tests")
            .to_compile_error()
            .into();
    }
    let attrs = strip(attrs, &["test"]);
    guarded(attrs, vis, sig, args.secs, quote! { #block })
}

/// Runs `body` on its own thread and panics if it has not reported back
/// within `secs`.
fn guarded(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream {
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Drops attributes whose path is exactly `path`, e.g. a stray `#[tokio::test]`.
fn strip(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            segments != path
        })
        .collect()
}
