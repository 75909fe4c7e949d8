//! Router calldata decoder built on compile-time ABI definitions.
//!
//! Only the Uniswap V2 Router02 swap family is recognized. Selectors and
//! argument layouts come from `alloy::sol!`, so decoding is a typed match on
//! the generated call enum instead of hand-sliced hex.

/// Ethereum mainnet contract addresses.
pub mod addresses {
    use alloy::primitives::{address, Address};

    /// Uniswap V2 Router02
    pub const UNISWAP_V2_ROUTER: Address = address!("7a250d5630B4cF539739dF2C5dAcb4c659F2488D");

    /// SushiSwap router (Router02 ABI)
    pub const SUSHISWAP_ROUTER: Address = address!("d9e1cE17f2641f24aE83637ab66a2cca9C378B9F");

    /// Wrapped Ether (WETH)
    pub const WETH: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");
}

/// Compile-time ABI for the Router02 swap functions.
pub mod uniswap_v2 {
    use alloy::sol;

    sol! {
        interface UniswapV2Router02 {
            function swapExactTokensForTokens(
                uint256 amountIn,
                uint256 amountOutMin,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external returns (uint256[] memory amounts);

            function swapTokensForExactTokens(
                uint256 amountOut,
                uint256 amountInMax,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external returns (uint256[] memory amounts);

            function swapExactETHForTokens(
                uint256 amountOutMin,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external payable returns (uint256[] memory amounts);

            function swapETHForExactTokens(
                uint256 amountOut,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external payable returns (uint256[] memory amounts);

            function swapTokensForExactETH(
                uint256 amountOut,
                uint256 amountInMax,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external returns (uint256[] memory amounts);

            function swapExactTokensForETH(
                uint256 amountIn,
                uint256 amountOutMin,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external returns (uint256[] memory amounts);

            function swapExactTokensForTokensSupportingFeeOnTransferTokens(
                uint256 amountIn,
                uint256 amountOutMin,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external;

            function swapExactETHForTokensSupportingFeeOnTransferTokens(
                uint256 amountOutMin,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external payable;

            function swapExactTokensForETHSupportingFeeOnTransferTokens(
                uint256 amountIn,
                uint256 amountOutMin,
                address[] calldata path,
                address to,
                uint256 deadline
            ) external;
        }
    }
}

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolInterface;
use thiserror::Error;

use uniswap_v2::UniswapV2Router02::UniswapV2Router02Calls as RouterCall;

/// Which side of the swap the user fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapShape {
    /// Input amount is known; output is at least `limit`.
    ExactInput,
    /// Output amount is known; input is at most `limit`.
    ExactOutput,
}

/// A decoded router swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSwap {
    pub shape: SwapShape,
    /// `amountIn` (or the attached value) for exact-input, `amountOut` for exact-output.
    pub amount: U256,
    /// `amountOutMin` for exact-input, `amountInMax` (or the attached value) for exact-output.
    pub limit: U256,
    pub path: Vec<Address>,
    /// The router wraps the attached ether before the first hop.
    pub native_in: bool,
    /// The router unwraps the last hop's output.
    pub native_out: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("calldata is not a supported router swap")]
    UnsupportedCall,
    #[error("swap path has {len} tokens, need at least two")]
    ShortPath { len: usize },
}

impl DecodedSwap {
    fn new(
        shape: SwapShape,
        amount: U256,
        limit: U256,
        path: Vec<Address>,
        native_in: bool,
        native_out: bool,
    ) -> Self {
        Self {
            shape,
            amount,
            limit,
            path,
            native_in,
            native_out,
        }
    }
}

/// Decodes Router02 swap calldata. `value` is the transaction's attached ether.
///
/// # Errors
/// Returns [`DecodeError::UnsupportedCall`] for any other selector or
/// malformed arguments, and [`DecodeError::ShortPath`] for single-token paths.
pub fn decode_router_call(input: &[u8], value: U256) -> Result<DecodedSwap, DecodeError> {
    use SwapShape::{ExactInput, ExactOutput};

    let call = RouterCall::abi_decode(input, true).map_err(|_| DecodeError::UnsupportedCall)?;
    let swap = match call {
        RouterCall::swapExactTokensForTokens(c) => {
            DecodedSwap::new(ExactInput, c.amountIn, c.amountOutMin, c.path, false, false)
        }
        RouterCall::swapExactTokensForTokensSupportingFeeOnTransferTokens(c) => {
            DecodedSwap::new(ExactInput, c.amountIn, c.amountOutMin, c.path, false, false)
        }
        RouterCall::swapExactETHForTokens(c) => {
            DecodedSwap::new(ExactInput, value, c.amountOutMin, c.path, true, false)
        }
        RouterCall::swapExactETHForTokensSupportingFeeOnTransferTokens(c) => {
            DecodedSwap::new(ExactInput, value, c.amountOutMin, c.path, true, false)
        }
        RouterCall::swapExactTokensForETH(c) => {
            DecodedSwap::new(ExactInput, c.amountIn, c.amountOutMin, c.path, false, true)
        }
        RouterCall::swapExactTokensForETHSupportingFeeOnTransferTokens(c) => {
            DecodedSwap::new(ExactInput, c.amountIn, c.amountOutMin, c.path, false, true)
        }
        RouterCall::swapTokensForExactTokens(c) => {
            DecodedSwap::new(ExactOutput, c.amountOut, c.amountInMax, c.path, false, false)
        }
        RouterCall::swapETHForExactTokens(c) => {
            DecodedSwap::new(ExactOutput, c.amountOut, value, c.path, true, false)
        }
        RouterCall::swapTokensForExactETH(c) => {
            DecodedSwap::new(ExactOutput, c.amountOut, c.amountInMax, c.path, false, true)
        }
    };

    if swap.path.len() < 2 {
        return Err(DecodeError::ShortPath {
            len: swap.path.len(),
        });
    }
    Ok(swap)
}
