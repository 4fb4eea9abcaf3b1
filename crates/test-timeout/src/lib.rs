//! Wraps async tests in a watchdog so a wedged runtime fails the test
//! instead of hanging the whole suite.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 30;

/// Runs an async test on a dedicated thread with its own current-thread
/// runtime and panics if it outlives the deadline (seconds, default 30).
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test(5)]
/// async fn finishes_quickly() { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let deadline_secs = if attr.is_empty() {
        DEFAULT_DEADLINE_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(secs) if secs > 0 => secs,
            Ok(_) => {
                return syn::Error::new_spanned(lit, "deadline must be at least one second")
                    .to_compile_error()
                    .into();
            }
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async function",
        )
        .to_compile_error()
        .into();
    }

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#deadline_secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("tokio runtime")
                        .block_on(async move #block);
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(_) => panic!("test exceeded its {}s deadline", #deadline_secs),
            }
        }
    })
}
