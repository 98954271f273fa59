//! `#[timeout_test]`: run a test on its own thread and fail it if it does not
//! finish within the budget. Async tests get a multi-threaded Tokio runtime
//! so blocking waits in the code under test cannot starve the test body.
//!
//! ```ignore
//! #[timeout_test(10)]
//! async fn finishes_quickly() { /* ... */ }
//!
//! #[timeout_test(secs = 30, workers = 4)]
//! async fn heavier() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{meta, parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_SECS: u64 = 60;
const DEFAULT_WORKERS: usize = 2;

struct Budget {
    secs: u64,
    workers: usize,
}

impl Budget {
    fn parse(attr: TokenStream) -> syn::Result<Self> {
        let mut budget = Budget {
            secs: DEFAULT_SECS,
            workers: DEFAULT_WORKERS,
        };
        if attr.is_empty() {
            return Ok(budget);
        }
        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            budget.secs = lit.base10_parse()?;
        } else {
            let parser = meta::parser(|meta| {
                if meta.path.is_ident("secs") {
                    budget.secs = meta.value()?.parse::<LitInt>()?.base10_parse()?;
                    Ok(())
                } else if meta.path.is_ident("workers") {
                    budget.workers = meta.value()?.parse::<LitInt>()?.base10_parse()?;
                    Ok(())
                } else {
                    Err(meta.error("expected `secs` or `workers`"))
                }
            });
            syn::parse::Parser::parse(parser, attr)?;
        }
        if budget.secs == 0 {
            return Err(syn::Error::new(Span::call_site(), "timeout must be greater than zero"));
        }
        if budget.workers == 0 {
            return Err(syn::Error::new(Span::call_site(), "workers must be greater than zero"));
        }
        Ok(budget)
    }
}

#[proc_macro_attribute]
pub fn timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let budget = match Budget::parse(attr) {
        Ok(budget) => budget,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !is_test_marker(attr)).collect();
    let secs = budget.secs;
    let workers = budget.workers;

    let body = if sig.asyncness.take().is_some() {
        quote! {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#workers)
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(budget, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    } else {
        quote! { #block }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(budget) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {} seconds", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated wrapper.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
